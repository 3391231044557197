use chrono::Local;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cycle::{run_every, unless_shutdown, CycleContext, Gate, Shutdown};
use crate::models::{ManagedAccount, TransactionRecord};
use crate::notify::Delivery;

/// Fee name the provider uses for its own card write-in rows
pub const CARD_WRITE_IN_FEE: &str = "金额写卡";

pub fn needs_notification(fee_name: &str) -> bool {
    fee_name != CARD_WRITE_IN_FEE
}

/// Result of scanning one account's transaction window
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Scan {
    pub watermark: i64,
    pub advanced: bool,
    pub notified: usize,
    pub suppressed: usize,
    pub unparsable: usize,
    /// Dispatch failed; rows from the failing one on were left uncommitted
    pub aborted: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransactionTick {
    pub checked: usize,
    pub tripped: usize,
    pub failures: usize,
    pub notified: usize,
    /// Write-in rows passed over without a notification
    pub suppressed: usize,
    pub unparsable: usize,
    /// Accounts whose scan stopped at a failed dispatch
    pub aborted: usize,
}

pub struct TransactionReconciler {
    ctx: CycleContext,
    period: Duration,
}

impl TransactionReconciler {
    pub fn new(ctx: CycleContext, period: Duration) -> Self {
        Self { ctx, period }
    }

    pub async fn run(&self, shutdown: Shutdown) {
        run_every("transactions", self.period, shutdown, move |s| async move {
            let report = self.tick(&s).await;
            debug!(?report, "transaction tick done");
        })
        .await;
    }

    pub async fn tick(&self, shutdown: &Shutdown) -> TransactionTick {
        let mut report = TransactionTick::default();

        let batch = match self.ctx.store.select_due_for_transaction_check(self.ctx.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "transaction cycle: database error");
                return report;
            }
        };
        if batch.is_empty() {
            return report;
        }

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
            let read = self.ctx.provider.get_recent_transactions(
                &account.session_token,
                &account.external_id,
                Local::now(),
            );
            let reply = match unless_shutdown(shutdown, read).await {
                None => {
                    info!(account = %account.name, "transaction check interrupted by shutdown");
                    break;
                }
                Some(Ok(reply)) => reply,
                Some(Err(e)) => {
                    report.failures += 1;
                    self.ctx.report_failure(&account, &e).await;
                    continue;
                }
            };
            self.ctx.adopt_session(&mut account, reply.session).await;
            debug!(account = %account.name, total = reply.value.total, rows = reply.value.rows.len(), "check transactions");

            let scan = self.scan(&account, &reply.value.rows).await;
            report.notified += scan.notified;
            report.suppressed += scan.suppressed;
            report.unparsable += scan.unparsable;
            if scan.aborted {
                report.aborted += 1;
            }

            if scan.advanced {
                if let Err(e) = self.ctx.store.update_watermark_if_higher(&account, scan.watermark).await {
                    error!(account = %account.name, error = %e, "failed to persist watermark");
                } else {
                    account.last_serial = scan.watermark;
                }
            }
        }

        report
    }

    /// Walk `rows` (newest-first) from oldest to newest, notifying for every
    /// serial above the watermark. Stops at the first failed dispatch.
    pub async fn scan(&self, account: &ManagedAccount, rows: &[TransactionRecord]) -> Scan {
        let mut scan = Scan { watermark: account.last_serial, ..Scan::default() };

        for row in rows.iter().rev() {
            let serial = match row.serial() {
                Ok(serial) => serial,
                Err(e) => {
                    warn!(account = %account.name, serial = %row.serial_no, error = %e, "bad serial number");
                    scan.unparsable += 1;
                    continue;
                }
            };
            if serial <= scan.watermark {
                continue;
            }

            info!(account = %account.name, serial, fee = %row.fee_name, money = %row.money, "new transaction");
            if needs_notification(&row.fee_name) {
                match self.ctx.notifier.notify_transaction(account, row).await {
                    Ok(Delivery::Delivered { .. }) => scan.notified += 1,
                    Ok(Delivery::NoChannel) => {
                        debug!(account = %account.name, serial, "no channel to notify");
                    }
                    Err(e) => {
                        error!(account = %account.name, serial, error = %e, "failed to notify");
                        scan.aborted = true;
                        break;
                    }
                }
            } else {
                debug!(account = %account.name, serial, fee = %row.fee_name, "notification skipped");
                scan.suppressed += 1;
            }

            scan.watermark = scan.watermark.max(serial);
            scan.advanced = true;
        }

        scan
    }
}
