//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the billing domain and the outside world. Adapters implement these ports.
//!
//! ## Ledger Ports
//!
//! - `LedgerStore` - Atomic subscription/payment/entitlement/event writes
//! - `SubscriptionEventLog` - Append-only event log and webhook dedup lookups
//! - `OperatorQueue` - Notifications parked for manual review
//!
//! ## External Ports
//!
//! - `StoreBillingClient` - Store server APIs (validate, cancel, refund)
//! - `ProductCatalog` - Product lookup by catalog or store product id
//! - `Clock` - Injectable time source

mod clock;
mod event_log;
mod ledger_store;
mod operator_queue;
mod product_catalog;
mod store_billing;

pub use clock::{Clock, SystemClock};
pub use event_log::{AppendResult, SubscriptionEventLog};
pub use ledger_store::{CommitOutcome, LedgerStore, LedgerWrite, SubscriptionWrite};
pub use operator_queue::{OperatorAlert, OperatorQueue};
pub use product_catalog::ProductCatalog;
pub use store_billing::{
    StoreBillingClient, StoreClients, StoreError, StoreLifecycle, StorePaymentState,
    StoreSubscriptionState,
};
