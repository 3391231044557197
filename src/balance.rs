use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::cycle::{run_every, unless_shutdown, CycleContext, Gate, Shutdown};
use crate::models::ManagedAccount;
use crate::provider::{transaction_number, AccountProvider, ProviderError, UNAVAILABLE_BALANCE};

/// Shortfalls below this are not worth a top-up
pub const MIN_TOPUP: Decimal = Decimal::TEN;
/// Largest single top-up
pub const MAX_TOPUP: Decimal = Decimal::ONE_HUNDRED;

/// Amount to recharge for `balance` against `threshold`, if any
pub fn topup_amount(balance: Decimal, threshold: Decimal) -> Option<Decimal> {
    let delta = threshold - balance;
    if delta < MIN_TOPUP {
        None
    } else {
        Some(delta.min(MAX_TOPUP))
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BalanceTick {
    pub checked: usize,
    pub tripped: usize,
    pub failures: usize,
    /// (account id, amount) per completed recharge
    pub recharged: Vec<(i64, Decimal)>,
}

pub struct BalanceReconciler {
    ctx: CycleContext,
    period: Duration,
}

impl BalanceReconciler {
    pub fn new(ctx: CycleContext, period: Duration) -> Self {
        Self { ctx, period }
    }

    pub async fn run(&self, shutdown: Shutdown) {
        run_every("balance", self.period, shutdown, move |s| async move {
            let report = self.tick(&s).await;
            debug!(?report, "balance tick done");
        })
        .await;
    }

    pub async fn tick(&self, shutdown: &Shutdown) -> BalanceTick {
        let mut report = BalanceTick::default();

        let batch = match self.ctx.store.select_due_for_balance_check(self.ctx.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "balance cycle: database error");
                return report;
            }
        };

        for mut account in batch {
            if shutdown.is_requested() {
                break;
            }
            match self.ctx.gate(&mut account).await {
                Gate::Proceed => {}
                Gate::SkipAccount => {
                    report.tripped += 1;
                    continue;
                }
                Gate::AbandonBatch => {
                    report.tripped += 1;
                    break;
                }
            }

            report.checked += 1;
            match self.reconcile(&mut account, shutdown).await {
                Ok(Some(amount)) => report.recharged.push((account.id, amount)),
                Ok(None) => {}
                Err(e) => {
                    report.failures += 1;
                    self.ctx.report_failure(&account, &e).await;
                }
            }
        }

        report
    }

    /// Check one balance and top it up when it fell far enough below the
    /// threshold. Returns the recharged amount. Shutdown may interrupt the
    /// balance read but never a started recharge.
    async fn reconcile(
        &self,
        account: &mut ManagedAccount,
        shutdown: &Shutdown,
    ) -> Result<Option<Decimal>, ProviderError> {
        let read = self.ctx.provider.get_balance(&account.session_token, &account.external_id);
        let Some(reply) = unless_shutdown(shutdown, read).await else {
            info!(account = %account.name, "balance check interrupted by shutdown");
            return Ok(None);
        };
        let reply = reply?;
        self.ctx.adopt_session(account, reply.session).await;

        let raw = reply.value.trim();
        if raw == UNAVAILABLE_BALANCE {
            info!(account = %account.name, "balance temporarily unavailable");
            return Ok(None);
        }
        let balance = Decimal::from_str(raw)
            .map_err(|_| ProviderError::Malformed(format!("unparsable balance {raw:?}")))?;
        info!(account = %account.name, %balance, threshold = %account.topup_threshold, "check balance");

        let Some(amount) = topup_amount(balance, account.topup_threshold) else {
            return Ok(None);
        };
        recharge(self.ctx.provider.as_ref(), account, amount).await?;
        Ok(Some(amount))
    }
}

/// Initiate, verify, choose method, pay. The first failing step aborts.
pub async fn recharge(
    provider: &dyn AccountProvider,
    account: &ManagedAccount,
    amount: Decimal,
) -> Result<String, ProviderError> {
    let pay_url = provider
        .initiate_recharge(amount, &account.open_id, &account.session_token, &account.external_id)
        .await?;
    let tran_no = transaction_number(&pay_url)?;

    provider.verify_signable(&tran_no).await?;
    provider.select_payment_method(&tran_no).await?;
    provider.execute_payment(&tran_no).await?;

    info!(account = %account.name, %amount, tran_no = %tran_no, "recharged card balance");
    Ok(tran_no)
}
