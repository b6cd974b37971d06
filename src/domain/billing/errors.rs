//! Billing error taxonomy.
//!
//! Errors are classified by how callers must react. Duplicates are
//! acknowledged, bad signatures and malformed payloads are rejected outright,
//! referential mismatches go to operators, and store outages or aborted
//! transactions retry the whole operation.

use axum::http::StatusCode;
use thiserror::Error;

use crate::domain::foundation::{DomainError, ErrorCode, ValidationError};

use super::{EventKind, SubscriptionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    /// Signature or certificate check failed. Nothing in the payload is trusted.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Payload could not be decoded or is structurally incomplete.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The store notification id is already in the event log.
    #[error("Duplicate notification: {0}")]
    DuplicateNotification(String),

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    /// A renewal or cancel referenced a correlation key with no local row.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Event {kind} is not valid for a subscription in status {from}")]
    InvalidTransition {
        from: SubscriptionStatus,
        kind: EventKind,
    },

    /// Store API unreachable, timed out, or persistently failing.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store API answered and refused the request.
    #[error("Store rejected request: {0}")]
    StoreRejected(String),

    /// The atomic unit rolled back. Safe to retry the whole operation.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl BillingError {
    /// Only aborted transactions and store outages are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::TransactionAborted(_) | BillingError::StoreUnavailable(_)
        )
    }

    /// Missing subscription, product or user. Written to the operator queue.
    pub fn is_referential_mismatch(&self) -> bool {
        matches!(
            self,
            BillingError::ProductNotFound(_)
                | BillingError::UserNotFound(_)
                | BillingError::SubscriptionNotFound(_)
        )
    }

    /// Short machine-readable code for logs and API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::InvalidSignature(_) => "INVALID_SIGNATURE",
            BillingError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            BillingError::DuplicateNotification(_) => "DUPLICATE_NOTIFICATION",
            BillingError::ProductNotFound(_) => "PRODUCT_NOT_FOUND",
            BillingError::UserNotFound(_) => "USER_NOT_FOUND",
            BillingError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            BillingError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BillingError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            BillingError::StoreRejected(_) => "STORE_REJECTED",
            BillingError::TransactionAborted(_) => "TRANSACTION_ABORTED",
            BillingError::Forbidden(_) => "FORBIDDEN",
            BillingError::Validation(_) => "VALIDATION_FAILED",
        }
    }

    /// HTTP status for both webhook and user-facing endpoints.
    ///
    /// Non-2xx webhook responses make the store redeliver.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BillingError::DuplicateNotification(_) => StatusCode::OK,
            BillingError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            BillingError::MalformedPayload(_) | BillingError::Validation(_) => StatusCode::BAD_REQUEST,
            BillingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BillingError::SubscriptionNotFound(_) => StatusCode::NOT_FOUND,
            BillingError::ProductNotFound(_) | BillingError::UserNotFound(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BillingError::InvalidTransition { .. } => StatusCode::CONFLICT,
            BillingError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BillingError::StoreRejected(_) => StatusCode::BAD_GATEWAY,
            BillingError::TransactionAborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DomainError> for BillingError {
    fn from(err: DomainError) -> Self {
        match err.code {
            ErrorCode::SubscriptionNotFound => BillingError::SubscriptionNotFound(err.message),
            ErrorCode::ProductNotFound => BillingError::ProductNotFound(err.message),
            ErrorCode::UserNotFound => BillingError::UserNotFound(err.message),
            ErrorCode::StoreUnavailable => BillingError::StoreUnavailable(err.message),
            ErrorCode::StoreRejected => BillingError::StoreRejected(err.message),
            ErrorCode::Unauthorized | ErrorCode::Forbidden => BillingError::Forbidden(err.message),
            ErrorCode::ValidationFailed
            | ErrorCode::EmptyField
            | ErrorCode::OutOfRange
            | ErrorCode::InvalidFormat
            | ErrorCode::InvalidStateTransition => BillingError::Validation(err.message),
            ErrorCode::ConcurrentModification
            | ErrorCode::CorrelationKeyConflict
            | ErrorCode::DatabaseError
            | ErrorCode::InternalError => BillingError::TransactionAborted(err.to_string()),
        }
    }
}

impl From<ValidationError> for BillingError {
    fn from(err: ValidationError) -> Self {
        BillingError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_are_acknowledged_with_200() {
        let err = BillingError::DuplicateNotification("n-1".into());
        assert_eq!(err.status_code(), StatusCode::OK);
        assert_eq!(err.code(), "DUPLICATE_NOTIFICATION");
    }

    #[test]
    fn rejected_payloads_are_not_acknowledged() {
        let err = BillingError::InvalidSignature("bad mac".into());
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            BillingError::MalformedPayload("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn only_aborts_and_outages_are_retryable() {
        assert!(BillingError::TransactionAborted("conflict".into()).is_retryable());
        assert!(BillingError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!BillingError::UserNotFound("u".into()).is_retryable());
        assert!(!BillingError::StoreRejected("410".into()).is_retryable());
    }

    #[test]
    fn referential_mismatches_are_classified() {
        assert!(BillingError::ProductNotFound("p".into()).is_referential_mismatch());
        assert!(BillingError::SubscriptionNotFound("s".into()).is_referential_mismatch());
        assert!(!BillingError::Validation("v".into()).is_referential_mismatch());
    }

    #[test]
    fn domain_errors_map_by_code() {
        let err: BillingError = DomainError::new(ErrorCode::ConcurrentModification, "stale version").into();
        assert!(matches!(err, BillingError::TransactionAborted(_)));

        let err: BillingError = DomainError::new(ErrorCode::UserNotFound, "no user u-1").into();
        assert_eq!(err, BillingError::UserNotFound("no user u-1".into()));
    }

    #[test]
    fn invalid_transition_message_names_status_and_kind() {
        let err = BillingError::InvalidTransition {
            from: SubscriptionStatus::Paused,
            kind: EventKind::GracePeriodEntered,
        };
        assert_eq!(
            err.to_string(),
            "Event grace_period_entered is not valid for a subscription in status paused"
        );
    }
}
