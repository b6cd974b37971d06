//! Periodic background workers.
//!
//! Each worker exposes `run_once` for tests and manual triggers and is
//! scheduled by [`spawn_worker`], which polls on the worker's interval until
//! the returned [`WorkerHandle`] is stopped.
//!
//! ## Graceful Shutdown
//!
//! Stopping lets the current pass finish; a pass is never interrupted
//! between two ledger units.

mod expiration_sweep;
mod reconciliation;

pub use expiration_sweep::{ExpirationSweepConfig, ExpirationSweepWorker};
pub use reconciliation::{ReconciliationWorker, ReconciliationWorkerConfig};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::domain::billing::{BillingError, EventSource, SubscriptionEvent};
use crate::domain::foundation::Timestamp;
use crate::ports::SubscriptionEventLog;

/// Counts reported at the end of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerTally {
    pub processed: usize,
    pub updated: usize,
    pub expired: usize,
    pub errors: usize,
}

#[async_trait]
pub trait PeriodicWorker: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One full pass. Per-item failures are counted in the tally; an `Err`
    /// means the pass itself could not run (e.g. the ledger is unreachable).
    async fn run_once(&self) -> Result<WorkerTally, BillingError>;
}

/// Appends the `<worker>.completed` system entry for a finished pass.
pub(crate) async fn record_tally(
    event_log: &dyn SubscriptionEventLog,
    worker: &str,
    tally: WorkerTally,
    now: Timestamp,
) -> Result<(), BillingError> {
    let payload = serde_json::to_value(tally).unwrap_or_default();
    let source = match worker {
        "reconciliation" => EventSource::Reconciliation,
        "expiration_sweep" => EventSource::ExpirationSweep,
        _ => EventSource::System,
    };
    event_log
        .append(SubscriptionEvent::system(format!("{}.completed", worker), source, payload, now))
        .await?;
    Ok(())
}

/// Running worker task.
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals shutdown and waits for the current pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(worker = self.name, error = %e, "Worker task failed");
        }
    }
}

/// Starts `worker` on its own task. The first pass runs immediately.
pub fn spawn_worker(worker: Arc<dyn PeriodicWorker>) -> WorkerHandle {
    let (shutdown, receiver) = watch::channel(false);
    let name = worker.name();
    let task = tokio::spawn(run(worker, receiver));
    WorkerHandle { name, shutdown, task }
}

async fn run(worker: Arc<dyn PeriodicWorker>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(worker.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(worker = worker.name(), interval_secs = worker.interval().as_secs(), "Worker started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!(worker = worker.name(), "Worker stopped");
                    return;
                }
            }

            _ = interval.tick() => {
                match worker.run_once().await {
                    Ok(tally) => tracing::info!(
                        worker = worker.name(),
                        processed = tally.processed,
                        updated = tally.updated,
                        expired = tally.expired,
                        errors = tally.errors,
                        "Worker pass completed"
                    ),
                    Err(e) => tracing::error!(worker = worker.name(), error = %e, "Worker pass failed"),
                }
            }
        }
    }
}
