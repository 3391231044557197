//! Plumbing shared by the balance and transaction cycles: the collaborators
//! each cycle drives, the shutdown signal, the tick loop, and the reaction to
//! a failed provider call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::budget::{Breaker, TripPolicy, MAX_CONSECUTIVE_FAILURES};
use crate::models::ManagedAccount;
use crate::notify::NotificationDispatcher;
use crate::provider::{AccountProvider, ProviderError};
use crate::store::AccountStore;

/// Accounts pulled from the store per tick
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Receiving side of the process shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

pub fn shutdown_channel() -> (watch::Sender<bool>, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (tx, Shutdown(rx))
}

impl Shutdown {
    /// True once shutdown was signalled or the sender is gone
    pub fn is_requested(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves when shutdown is requested
    pub async fn requested(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Drive `fut` unless shutdown is requested first, in which case it is
/// dropped and `None` returned
pub async fn unless_shutdown<F: Future>(shutdown: &Shutdown, fut: F) -> Option<F::Output> {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        biased;
        _ = shutdown.requested() => None,
        out = fut => Some(out),
    }
}

/// Call `tick` every `period` until shutdown. The first tick fires at once.
pub async fn run_every<F, Fut>(name: &'static str, period: Duration, mut shutdown: Shutdown, mut tick: F)
where
    F: FnMut(Shutdown) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(cycle = name, period_secs = period.as_secs(), "cycle started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.requested() => {}
        }
        if shutdown.is_requested() {
            break;
        }
        tick(shutdown.clone()).await;
    }

    info!(cycle = name, "cycle stopped");
}

/// What to do with an account after consulting the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    SkipAccount,
    AbandonBatch,
}

#[derive(Clone)]
pub struct CycleContext {
    pub store: Arc<dyn AccountStore>,
    pub provider: Arc<dyn AccountProvider>,
    pub breaker: Breaker,
    pub notifier: NotificationDispatcher,
    pub batch_size: usize,
}

impl CycleContext {
    /// Breaker check at the start of an account. A trip maps to skipping or
    /// abandoning the batch according to the configured policy.
    pub async fn gate(&self, account: &mut ManagedAccount) -> Gate {
        if !self.breaker.should_trip(account).await {
            return Gate::Proceed;
        }
        match self.breaker.policy() {
            TripPolicy::AbandonBatch => Gate::AbandonBatch,
            TripPolicy::SkipAccount => Gate::SkipAccount,
        }
    }

    /// Charge the failure to the account's session and tell the holder,
    /// for the first few failures only.
    pub async fn report_failure(&self, account: &ManagedAccount, err: &ProviderError) {
        let count = self.breaker.budget().record_failure(&account.session_token);
        warn!(account = %account.name, id = account.id, failures = count, error = %err, "provider call failed");

        if count > MAX_CONSECUTIVE_FAILURES {
            return;
        }
        if let Err(e) = self.notifier.notify_error(account, &err.to_string()).await {
            error!(account = %account.name, error = %e, "failed to send error notification");
        }
    }

    /// Persist a session token the provider rotated during a call
    pub async fn adopt_session(&self, account: &mut ManagedAccount, session: Option<String>) {
        let Some(token) = session else { return };
        if token == account.session_token {
            return;
        }
        info!(account = %account.name, id = account.id, "provider rotated session token");
        match self.store.update_session_token(account, &token).await {
            Ok(()) => self.breaker.budget().transfer(&account.session_token, &token),
            Err(e) => {
                error!(account = %account.name, error = %e, "failed to persist rotated session token");
            }
        }
        account.session_token = token;
    }
}
