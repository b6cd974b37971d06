//! ReconciliationWorker - periodic drift correction against the stores.
//!
//! ## Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `interval` | 24h | Time between passes |
//! | `batch_size` | 100 | Rows read per ledger page |
//! | `concurrency` | 8 | Store calls in flight |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::application::handlers::billing::{ReconcileResult, Reconciler};
use crate::domain::billing::{BillingError, SubscriptionStatus};
use crate::domain::foundation::SubscriptionId;
use crate::ports::{Clock, LedgerStore, SubscriptionEventLog};

use super::{record_tally, PeriodicWorker, WorkerTally};

#[derive(Debug, Clone)]
pub struct ReconciliationWorkerConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl Default for ReconciliationWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
            concurrency: 8,
        }
    }
}

pub struct ReconciliationWorker {
    ledger: Arc<dyn LedgerStore>,
    event_log: Arc<dyn SubscriptionEventLog>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    config: ReconciliationWorkerConfig,
}

impl ReconciliationWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        event_log: Arc<dyn SubscriptionEventLog>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
        config: ReconciliationWorkerConfig,
    ) -> Self {
        Self {
            ledger,
            event_log,
            reconciler,
            clock,
            config,
        }
    }

    fn statuses() -> Vec<SubscriptionStatus> {
        SubscriptionStatus::ALL
            .into_iter()
            .filter(SubscriptionStatus::needs_reconciliation)
            .collect()
    }
}

#[async_trait]
impl PeriodicWorker for ReconciliationWorker {
    fn name(&self) -> &'static str {
        "reconciliation"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<WorkerTally, BillingError> {
        let statuses = Self::statuses();
        let batch_size = self.config.batch_size.max(1);
        let mut tally = WorkerTally::default();
        let mut after: Option<SubscriptionId> = None;

        loop {
            let page = self.ledger.list_by_status(&statuses, after, batch_size).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.id);
            let page_len = page.len();

            let results: Vec<_> = stream::iter(page.into_iter().filter(|s| self.reconciler.supports(s.store)))
                .map(|subscription| async move {
                    let result = self.reconciler.reconcile_subscription(&subscription).await;
                    (subscription, result)
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

            for (subscription, result) in results {
                tally.processed += 1;
                match result {
                    Ok(ReconcileResult::InSync | ReconcileResult::Unresolved { .. }) => {}
                    Ok(corrected) => {
                        tally.updated += 1;
                        if corrected.expired() {
                            tally.expired += 1;
                        }
                    }
                    Err(e) => {
                        tally.errors += 1;
                        tracing::warn!(
                            subscription_id = %subscription.id,
                            store = %subscription.store,
                            error = %e,
                            retryable = e.is_retryable(),
                            "Reconciliation failed for subscription"
                        );
                    }
                }
            }

            if page_len < batch_size {
                break;
            }
        }

        record_tally(self.event_log.as_ref(), self.name(), tally, self.clock.now()).await?;
        Ok(tally)
    }
}
