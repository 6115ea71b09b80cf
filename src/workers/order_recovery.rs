//! Restart recovery for pending payment orders
//!
//! Pollers live in memory, so a restart loses them while the customer may
//! still be paying. This worker sweeps recent `pending` orders on an
//! interval and, for any order nobody is watching, either resumes polling
//! or records the timeout the poller would have reached.

use crate::config::RecoveryConfig;
use crate::database::order_repository::OrderStore;
use crate::services::clock::Clock;
use crate::services::reconciliation::{ReconciliationService, StatusUpdate};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    pub scanned: usize,
    pub resumed: usize,
    pub timed_out: usize,
    pub skipped: usize,
}

pub struct OrderRecoveryWorker {
    service: Arc<ReconciliationService>,
    orders: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl OrderRecoveryWorker {
    pub fn new(
        service: Arc<ReconciliationService>,
        orders: Arc<dyn OrderStore>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            service,
            orders,
            clock,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            window_hours = self.config.window_hours,
            batch_size = self.config.batch_size,
            "order recovery worker started"
        );

        // First sweep right away so orders from before a restart are picked up
        if let Err(e) = self.run_cycle().await {
            warn!(error = %e, "order recovery cycle failed");
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("order recovery worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "order recovery cycle failed");
                    }
                }
            }
        }

        info!("order recovery worker stopped");
    }

    /// One sweep. Orders inside the recovery window are resumed or timed
    /// out by age; orders older than the window are always timed out.
    pub async fn run_cycle(&self) -> anyhow::Result<RecoverySummary> {
        let now = self.clock.now();
        let since = now - chrono::Duration::hours(self.config.window_hours);
        let mut pending = self.orders.list_pending(since, self.config.batch_size).await?;
        pending.extend(
            self.orders
                .list_pending_before(since, self.config.batch_size)
                .await?,
        );
        let poller = self.service.poller_config();

        let mut summary = RecoverySummary {
            scanned: pending.len(),
            ..RecoverySummary::default()
        };

        for order in pending {
            let client_txn_id = order.client_txn_id.as_str();
            if self.service.is_polling(client_txn_id) {
                summary.skipped += 1;
                continue;
            }

            let age = (now - order.created_at).to_std().unwrap_or_default();
            // Just initiated; the initiating request starts its own poller.
            if age < poller.interval {
                debug!(client_txn_id = %client_txn_id, "pending order too new to recover");
                summary.skipped += 1;
                continue;
            }

            if age < poller.max_duration {
                match self.service.watch(client_txn_id).await {
                    Ok(_) => {
                        info!(
                            client_txn_id = %client_txn_id,
                            age_secs = age.as_secs(),
                            "resumed polling for pending order"
                        );
                        summary.resumed += 1;
                    }
                    Err(e) => {
                        debug!(client_txn_id = %client_txn_id, error = %e, "pending order not resumed");
                        summary.skipped += 1;
                    }
                }
                continue;
            }

            match self
                .service
                .on_status_update(client_txn_id, StatusUpdate::timeout(age))
                .await
            {
                Ok(_) => {
                    info!(
                        client_txn_id = %client_txn_id,
                        age_secs = age.as_secs(),
                        "stale pending order marked as timed out"
                    );
                    summary.timed_out += 1;
                }
                Err(e) => {
                    warn!(client_txn_id = %client_txn_id, error = %e, "could not time out stale order");
                    summary.skipped += 1;
                }
            }
        }

        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                resumed = summary.resumed,
                timed_out = summary.timed_out,
                skipped = summary.skipped,
                "order recovery sweep finished"
            );
        }
        Ok(summary)
    }
}
