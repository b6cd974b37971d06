//! Axum router configuration for billing endpoints.

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{
    app_store_webhook, cancel_subscription, get_entitlement, list_operator_alerts, list_subscriptions,
    mobile_webhook, refund_subscription, web_webhook, BillingAppState,
};

/// Billing API routes, mounted at `/api/billing`.
///
/// # Routes
///
/// ## User Endpoints (require `X-User-Id`)
/// - `GET /entitlement` - Current entitlement
/// - `GET /subscriptions` - Subscriptions with payment history
/// - `POST /subscriptions/:id/cancel` - Cancel at the store
///
/// ## Admin Endpoints (require the admin role)
/// - `POST /subscriptions/:id/refund` - Refund a charge
/// - `GET /operator/alerts` - Parked notifications
pub fn billing_routes() -> Router<BillingAppState> {
    Router::new()
        .route("/entitlement", get(get_entitlement))
        .route("/subscriptions", get(list_subscriptions))
        .route("/subscriptions/:id/cancel", post(cancel_subscription))
        .route("/subscriptions/:id/refund", post(refund_subscription))
        .route("/operator/alerts", get(list_operator_alerts))
}

/// Store webhook routes, mounted at `/webhooks`.
///
/// No principal; each payload is verified by its store's normalizer.
pub fn webhook_routes() -> Router<BillingAppState> {
    Router::new()
        .route("/mobile", post(mobile_webhook))
        .route("/appstore", post(app_store_webhook))
        .route("/web", post(web_webhook))
}

/// Combined billing router.
pub fn billing_router() -> Router<BillingAppState> {
    Router::new()
        .nest("/api/billing", billing_routes())
        .nest("/webhooks", webhook_routes())
}
