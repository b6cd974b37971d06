//! Foundation module - Shared domain primitives.
//!
//! Value objects, identifiers and error types that form the vocabulary
//! of the billing domain.

mod auth;
mod errors;
mod ids;
mod money;
mod state_machine;
mod timestamp;

pub use auth::{AuthError, AuthenticatedUser, ADMIN_ROLE};
pub use errors::{DomainError, ErrorCode, ValidationError};
pub use ids::{OperatorAlertId, PaymentRecordId, ProductId, SubscriptionEventId, SubscriptionId, UserId};
pub use money::Money;
pub use state_machine::StateMachine;
pub use timestamp::Timestamp;
