//! Application layer - Commands, Queries, Handlers and Workers.
//!
//! This layer orchestrates domain operations and coordinates between ports.
//! Command handlers (write) all funnel into the transaction processor; query
//! handlers (read) go straight to the ledger.

pub mod handlers;
pub mod workers;

pub use handlers::billing::{
    CancelSubscriptionCommand, CancelSubscriptionHandler, GetEntitlementHandler,
    HandleStoreNotificationCommand, HandleStoreNotificationHandler, HandleStoreNotificationResult,
    ListOperatorAlertsHandler, ListSubscriptionsHandler, Reconciler, RefundSubscriptionCommand,
    RefundSubscriptionHandler, TransactionProcessor,
};
pub use workers::{
    spawn_worker, ExpirationSweepConfig, ExpirationSweepWorker, PeriodicWorker,
    ReconciliationWorker, ReconciliationWorkerConfig, WorkerHandle, WorkerTally,
};
