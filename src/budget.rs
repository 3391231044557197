//! Per-session error budget and the circuit breaker built on it.
//!
//! Both reconciliation cycles share one [`ErrorBudget`]. Counts are keyed by
//! session token and only cleared when the breaker trips; a successful call
//! does not reset them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, warn};

use crate::models::ManagedAccount;
use crate::store::AccountStore;

/// Consecutive failures tolerated before the breaker trips.
/// Also the number of error notifications sent per session.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Default)]
pub struct ErrorBudget {
    failures: Mutex<HashMap<String, u32>>,
}

impl ErrorBudget {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        // the map holds plain counters, a panic mid-update cannot corrupt it
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one more failure for `session`, returning the new count
    pub fn record_failure(&self, session: &str) -> u32 {
        let mut map = self.map();
        let count = map.entry(session.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failures(&self, session: &str) -> u32 {
        self.map().get(session).copied().unwrap_or(0)
    }

    /// Move the count of a rotated session onto its replacement token
    pub fn transfer(&self, from: &str, to: &str) {
        let mut map = self.map();
        if let Some(count) = map.remove(from) {
            *map.entry(to.to_string()).or_insert(0) += count;
        }
    }

    /// Remove the entry if its count exceeds `limit`; check and removal
    /// happen under one lock.
    pub fn take_if_exceeded(&self, session: &str, limit: u32) -> Option<u32> {
        let mut map = self.map();
        match map.get(session) {
            Some(&count) if count > limit => map.remove(session),
            _ => None,
        }
    }
}

/// What a cycle does with the rest of its batch after a trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripPolicy {
    /// Stop the tick; remaining accounts wait for the next one
    AbandonBatch,
    /// Skip only the tripped account
    SkipAccount,
}

impl TripPolicy {
    pub fn from_abandon_flag(abandon: bool) -> Self {
        if abandon {
            TripPolicy::AbandonBatch
        } else {
            TripPolicy::SkipAccount
        }
    }
}

#[derive(Clone)]
pub struct Breaker {
    budget: Arc<ErrorBudget>,
    store: Arc<dyn AccountStore>,
    policy: TripPolicy,
}

impl Breaker {
    pub fn new(budget: Arc<ErrorBudget>, store: Arc<dyn AccountStore>, policy: TripPolicy) -> Self {
        Self { budget, store, policy }
    }

    pub fn policy(&self) -> TripPolicy {
        self.policy
    }

    pub fn budget(&self) -> &ErrorBudget {
        &self.budget
    }

    /// Trip when the session's failure count exceeds the limit: automation is
    /// switched off and persisted, and the budget entry is cleared.
    pub async fn should_trip(&self, account: &mut ManagedAccount) -> bool {
        let Some(count) = self
            .budget
            .take_if_exceeded(&account.session_token, MAX_CONSECUTIVE_FAILURES)
        else {
            return false;
        };

        warn!(account = %account.name, id = account.id, failures = count, "breaker tripped, disabling automation");
        account.disable_automation();
        if let Err(e) = self.store.update_automation_flags(account).await {
            error!(account = %account.name, error = %e, "breaker tripped but failed to disable account");
        }
        true
    }
}
