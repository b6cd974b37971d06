//! ExpirationSweepWorker - expires entitled subscriptions whose end has passed.
//!
//! Catches every case where the store's expiry notification never arrived,
//! so no user keeps access past the effective end of their subscription.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::application::handlers::billing::{SubscriptionRef, TransactionProcessor};
use crate::domain::billing::{
    BillingError, EventKind, EventSource, NormalizedEvent, SubscriptionStatus,
};
use crate::domain::foundation::SubscriptionId;
use crate::ports::{LedgerStore, SubscriptionEventLog};

use super::{record_tally, PeriodicWorker, WorkerTally};

#[derive(Debug, Clone)]
pub struct ExpirationSweepConfig {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for ExpirationSweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4 * 60 * 60),
            batch_size: 500,
        }
    }
}

pub struct ExpirationSweepWorker {
    ledger: Arc<dyn LedgerStore>,
    event_log: Arc<dyn SubscriptionEventLog>,
    processor: Arc<TransactionProcessor>,
    config: ExpirationSweepConfig,
}

impl ExpirationSweepWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        event_log: Arc<dyn SubscriptionEventLog>,
        processor: Arc<TransactionProcessor>,
        config: ExpirationSweepConfig,
    ) -> Self {
        Self {
            ledger,
            event_log,
            processor,
            config,
        }
    }

    fn statuses() -> Vec<SubscriptionStatus> {
        SubscriptionStatus::ALL
            .into_iter()
            .filter(SubscriptionStatus::grants_entitlement)
            .collect()
    }
}

#[async_trait]
impl PeriodicWorker for ExpirationSweepWorker {
    fn name(&self) -> &'static str {
        "expiration_sweep"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<WorkerTally, BillingError> {
        let now = self.processor.clock().now();
        let statuses = Self::statuses();
        let batch_size = self.config.batch_size.max(1);
        let mut tally = WorkerTally::default();
        let mut after: Option<SubscriptionId> = None;

        loop {
            let page = self.ledger.list_by_status(&statuses, after, batch_size).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.id);
            let page_len = page.len();

            for subscription in page.into_iter().filter(|s| s.is_overdue_at(now)) {
                tally.processed += 1;
                // a store clock ahead of ours must not make the expiry stale
                let event_time = subscription.last_validated_at.map_or(now, |last| last.max(now));
                let event =
                    NormalizedEvent::synthesized(EventKind::Expired, subscription.correlation.clone(), event_time);

                match self
                    .processor
                    .apply_lifecycle_event(SubscriptionRef::Id(subscription.id), event, EventSource::ExpirationSweep)
                    .await
                {
                    Ok(outcome) if outcome.subscription.status() == SubscriptionStatus::Expired => {
                        tally.updated += 1;
                        tally.expired += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tally.errors += 1;
                        tracing::warn!(
                            subscription_id = %subscription.id,
                            error = %e,
                            "Failed to expire subscription"
                        );
                    }
                }
            }

            if page_len < batch_size {
                break;
            }
        }

        record_tally(self.event_log.as_ref(), self.name(), tally, now).await?;
        Ok(tally)
    }
}
