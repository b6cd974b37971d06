//! HTTP DTOs for billing endpoints.
//!
//! JSON request/response shapes; the boundary between HTTP and the
//! application layer.

use serde::{Deserialize, Serialize};

use crate::application::handlers::billing::{
    CancelSubscriptionResult, HandleStoreNotificationResult, RefundSubscriptionResult, SubscriptionView,
};
use crate::domain::billing::{Entitlement, PaymentRecord, Subscription};

// ════════════════════════════════════════════════════════════════════════════════
// Request DTOs
// ════════════════════════════════════════════════════════════════════════════════

/// Request to cancel a subscription.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelSubscriptionRequest {
    /// End access now instead of at period end.
    #[serde(default)]
    pub immediate: bool,
}

/// Request to refund a subscription charge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundSubscriptionRequest {
    /// Store transaction id of the charge; the latest charge when absent.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Query parameters for subscription listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSubscriptionsParams {
    #[serde(default)]
    pub include_superseded: bool,
}

/// Query parameters for the operator queue.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListAlertsParams {
    pub limit: Option<usize>,
}

// ════════════════════════════════════════════════════════════════════════════════
// Response DTOs
// ════════════════════════════════════════════════════════════════════════════════

/// Webhook acknowledgement. Carries no business data.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebhookAck {
    pub status: &'static str,
}

impl WebhookAck {
    pub const PARKED: WebhookAck = WebhookAck { status: "parked" };
}

impl From<&HandleStoreNotificationResult> for WebhookAck {
    fn from(result: &HandleStoreNotificationResult) -> Self {
        let status = match result {
            HandleStoreNotificationResult::Processed { .. } => "processed",
            HandleStoreNotificationResult::Duplicate { .. } => "duplicate",
            HandleStoreNotificationResult::Unsupported { .. } => "unsupported",
        };
        WebhookAck { status }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitlementResponse {
    pub user_id: String,
    pub is_entitled: bool,
    /// ISO 8601; absent when not entitled.
    pub expires_at: Option<String>,
    pub subscription_id: Option<String>,
    pub computed_at: String,
}

impl From<Entitlement> for EntitlementResponse {
    fn from(entitlement: Entitlement) -> Self {
        Self {
            user_id: entitlement.user_id.to_string(),
            is_entitled: entitlement.is_entitled,
            expires_at: entitlement.expires_at.map(|t| t.to_string()),
            subscription_id: entitlement.subscription_id.map(|id| id.to_string()),
            computed_at: entitlement.computed_at.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentResponse {
    pub id: String,
    pub store_transaction_id: String,
    pub transaction_type: &'static str,
    /// Signed minor units; negative for refunds.
    pub amount_minor: i64,
    pub currency: String,
    pub status: &'static str,
    pub transaction_date: String,
}

impl From<PaymentRecord> for PaymentResponse {
    fn from(record: PaymentRecord) -> Self {
        Self {
            id: record.id.to_string(),
            store_transaction_id: record.key.store_transaction_id,
            transaction_type: record.transaction_type.as_str(),
            amount_minor: record.amount.amount_minor,
            currency: record.amount.currency,
            status: record.status.as_str(),
            transaction_date: record.transaction_date.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionResponse {
    pub id: String,
    pub store: &'static str,
    pub product_id: String,
    pub status: &'static str,
    pub auto_renewing: bool,
    pub start_date: String,
    pub current_period_end: String,
    pub grace_period_end: Option<String>,
    pub trial_end_date: Option<String>,
    pub superseded_by: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub payments: Vec<PaymentResponse>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        Self {
            id: sub.id.to_string(),
            store: sub.store.as_str(),
            product_id: sub.product_id.to_string(),
            status: sub.status().as_str(),
            auto_renewing: sub.auto_renewing,
            start_date: sub.start_date.to_string(),
            current_period_end: sub.current_period_end.to_string(),
            grace_period_end: sub.grace_period_end.map(|t| t.to_string()),
            trial_end_date: sub.trial_end_date.map(|t| t.to_string()),
            superseded_by: sub.superseded_by.map(|id| id.to_string()),
            payments: Vec::new(),
        }
    }
}

impl From<SubscriptionView> for SubscriptionResponse {
    fn from(view: SubscriptionView) -> Self {
        let mut response = SubscriptionResponse::from(view.subscription);
        response.payments = view.payments.into_iter().map(PaymentResponse::from).collect();
        response
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionListResponse {
    pub subscriptions: Vec<SubscriptionResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelSubscriptionResponse {
    pub subscription: SubscriptionResponse,
    /// When access ends (ISO 8601).
    pub effective_at: String,
    pub is_entitled: Option<bool>,
}

impl From<CancelSubscriptionResult> for CancelSubscriptionResponse {
    fn from(result: CancelSubscriptionResult) -> Self {
        Self {
            subscription: result.subscription.into(),
            effective_at: result.effective_at.to_string(),
            is_entitled: result.entitlement.map(|e| e.is_entitled),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundSubscriptionResponse {
    pub subscription: SubscriptionResponse,
    pub refund: Option<PaymentResponse>,
    pub already_applied: bool,
}

impl From<RefundSubscriptionResult> for RefundSubscriptionResponse {
    fn from(result: RefundSubscriptionResult) -> Self {
        Self {
            subscription: result.subscription.into(),
            refund: result.refund.map(PaymentResponse::from),
            already_applied: result.already_applied,
        }
    }
}

/// Standard error body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub error_code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}
