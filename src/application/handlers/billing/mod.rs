//! Billing handlers.
//!
//! ## Commands
//! - Processing store webhooks
//! - User cancellation
//! - Operator refunds
//!
//! ## Queries
//! - Entitlement and subscription listing
//! - Operator queue
//!
//! Every ledger mutation goes through [`TransactionProcessor`]; the
//! [`Reconciler`] is shared by the webhook handler (orphan recovery) and the
//! reconciliation worker.

mod cancel_subscription;
mod handle_store_notification;
mod keyed_lock;
mod processor;
mod queries;
mod reconcile;
mod refund_subscription;

pub use keyed_lock::KeyedLocks;
pub use processor::{
    PaymentEvent, ProcessOutcome, ProcessorConfig, SubscriptionRef, TransactionProcessor,
};
pub use reconcile::{drift_events, ReconcileResult, Reconciler};

// Commands
pub use cancel_subscription::{
    CancelSubscriptionCommand, CancelSubscriptionHandler, CancelSubscriptionResult,
};
pub use handle_store_notification::{
    HandleStoreNotificationCommand, HandleStoreNotificationHandler, HandleStoreNotificationResult,
};
pub use refund_subscription::{
    RefundSubscriptionCommand, RefundSubscriptionHandler, RefundSubscriptionResult,
};

// Queries
pub use queries::{
    GetEntitlementHandler, GetEntitlementQuery, ListOperatorAlertsHandler, ListOperatorAlertsQuery,
    ListSubscriptionsHandler, ListSubscriptionsQuery, SubscriptionView,
};
