//! Billing domain module.
//!
//! Subscription ledger, store notification normalization and the
//! financial records they produce. No I/O happens here.
//!
//! # Module Structure
//!
//! - `store` - billing stores and correlation keys
//! - `event_kind` - canonical lifecycle event kinds
//! - `status` - subscription state machine and transition table
//! - `subscription` - subscription aggregate
//! - `payment` - payment records and idempotency keys
//! - `audit` - append-only event log entries
//! - `entitlement` - derived entitlement projection
//! - `product` - catalog products
//! - `notification` - store payload normalizers
//! - `errors` - billing error taxonomy

mod audit;
mod entitlement;
mod errors;
mod event_kind;
pub mod notification;
mod payment;
mod product;
mod status;
mod store;
mod subscription;

pub use audit::{EventOutcome, EventSource, SubscriptionEvent};
pub use entitlement::Entitlement;
pub use errors::BillingError;
pub use event_kind::EventKind;
pub use notification::{NormalizeOutcome, NormalizedEvent, NotificationNormalizer, RawNotification};
pub use payment::{PaymentKey, PaymentRecord, PaymentStatus, TransactionType};
pub use product::{Product, StoreProductIds};
pub use status::{Resolution, SubscriptionStatus};
pub use store::{Store, StoreRef};
pub use subscription::{ApplyOutcome, NewSubscription, Subscription};
