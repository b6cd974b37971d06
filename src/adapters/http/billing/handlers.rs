//! HTTP handlers for billing endpoints.
//!
//! Connect axum routes to the billing command/query handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Json, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::adapters::http::middleware::RequireAuth;
use crate::application::handlers::billing::{
    CancelSubscriptionCommand, CancelSubscriptionHandler, GetEntitlementHandler, GetEntitlementQuery,
    HandleStoreNotificationCommand, HandleStoreNotificationHandler, ListOperatorAlertsHandler,
    ListOperatorAlertsQuery, ListSubscriptionsHandler, ListSubscriptionsQuery,
    RefundSubscriptionCommand, RefundSubscriptionHandler, TransactionProcessor,
};
use crate::domain::billing::{BillingError, Store};
use crate::domain::foundation::SubscriptionId;
use crate::ports::{LedgerStore, OperatorQueue, StoreClients};

use super::dto::{
    CancelSubscriptionRequest, CancelSubscriptionResponse, EntitlementResponse, ErrorResponse,
    ListAlertsParams, ListSubscriptionsParams, RefundSubscriptionRequest, RefundSubscriptionResponse,
    SubscriptionListResponse, SubscriptionResponse, WebhookAck,
};

/// Header carrying the web gateway's `t=..,v1=..` signature.
pub const GATEWAY_SIGNATURE_HEADER: &str = "Gateway-Signature";

const DEFAULT_ALERT_LIMIT: usize = 100;

// ════════════════════════════════════════════════════════════════════════════════
// Application State
// ════════════════════════════════════════════════════════════════════════════════

/// Shared state for billing routes; cloned per request.
#[derive(Clone)]
pub struct BillingAppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub operator_queue: Arc<dyn OperatorQueue>,
    pub processor: Arc<TransactionProcessor>,
    pub clients: StoreClients,
    /// Holds the configured normalizers, so it is built once.
    pub notifications: Arc<HandleStoreNotificationHandler>,
}

impl BillingAppState {
    pub fn entitlement_handler(&self) -> GetEntitlementHandler {
        GetEntitlementHandler::new(self.ledger.clone(), self.processor.clock().clone())
    }

    pub fn list_subscriptions_handler(&self) -> ListSubscriptionsHandler {
        ListSubscriptionsHandler::new(self.ledger.clone())
    }

    pub fn cancel_handler(&self) -> CancelSubscriptionHandler {
        CancelSubscriptionHandler::new(self.ledger.clone(), self.processor.clone(), self.clients.clone())
    }

    pub fn refund_handler(&self) -> RefundSubscriptionHandler {
        RefundSubscriptionHandler::new(self.ledger.clone(), self.processor.clone(), self.clients.clone())
    }

    pub fn alerts_handler(&self) -> ListOperatorAlertsHandler {
        ListOperatorAlertsHandler::new(self.operator_queue.clone())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Webhooks (signature verified, no principal)
// ════════════════════════════════════════════════════════════════════════════════

/// POST /webhooks/mobile
pub async fn mobile_webhook(State(state): State<BillingAppState>, body: Bytes) -> Result<Response, ApiError> {
    receive_notification(&state, Store::Mobile, None, body).await
}

/// POST /webhooks/appstore
pub async fn app_store_webhook(State(state): State<BillingAppState>, body: Bytes) -> Result<Response, ApiError> {
    receive_notification(&state, Store::AppStore, None, body).await
}

/// POST /webhooks/web
pub async fn web_webhook(
    State(state): State<BillingAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let signature = headers
        .get(GATEWAY_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    receive_notification(&state, Store::Web, signature, body).await
}

async fn receive_notification(
    state: &BillingAppState,
    store: Store,
    signature: Option<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let cmd = HandleStoreNotificationCommand {
        store,
        body: body.to_vec(),
        signature,
    };

    match state.notifications.handle(cmd).await {
        Ok(result) => Ok((StatusCode::OK, Json(WebhookAck::from(&result))).into_response()),
        // parked on the operator queue; redelivery cannot fix it
        Err(err) if err.is_referential_mismatch() => {
            tracing::warn!(store = %store, error = %err, "Notification parked for operator review");
            Ok((StatusCode::OK, Json(WebhookAck::PARKED)).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Query Handlers (GET endpoints)
// ════════════════════════════════════════════════════════════════════════════════

/// GET /api/billing/entitlement - Current user's entitlement
pub async fn get_entitlement(
    State(state): State<BillingAppState>,
    RequireAuth(user): RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let entitlement = state
        .entitlement_handler()
        .handle(GetEntitlementQuery { user_id: user.id })
        .await?;

    Ok(Json(EntitlementResponse::from(entitlement)))
}

/// GET /api/billing/subscriptions - Current user's subscriptions
pub async fn list_subscriptions(
    State(state): State<BillingAppState>,
    RequireAuth(user): RequireAuth,
    Query(params): Query<ListSubscriptionsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let views = state
        .list_subscriptions_handler()
        .handle(ListSubscriptionsQuery {
            user_id: user.id,
            include_superseded: params.include_superseded,
        })
        .await?;

    Ok(Json(SubscriptionListResponse {
        subscriptions: views.into_iter().map(SubscriptionResponse::from).collect(),
    }))
}

/// GET /api/billing/operator/alerts - Parked notifications (admin only)
pub async fn list_operator_alerts(
    State(state): State<BillingAppState>,
    RequireAuth(user): RequireAuth,
    Query(params): Query<ListAlertsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let alerts = state
        .alerts_handler()
        .handle(ListOperatorAlertsQuery {
            operator: user,
            limit: params.limit.unwrap_or(DEFAULT_ALERT_LIMIT),
        })
        .await?;

    Ok(Json(alerts))
}

// ════════════════════════════════════════════════════════════════════════════════
// Command Handlers (POST endpoints)
// ════════════════════════════════════════════════════════════════════════════════

/// POST /api/billing/subscriptions/:id/cancel - Cancel at the store
pub async fn cancel_subscription(
    State(state): State<BillingAppState>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<String>,
    request: Option<Json<CancelSubscriptionRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let cmd = CancelSubscriptionCommand {
        user,
        subscription_id: parse_subscription_id(&id)?,
        immediate: request.immediate,
    };

    let result = state.cancel_handler().handle(cmd).await?;

    Ok(Json(CancelSubscriptionResponse::from(result)))
}

/// POST /api/billing/subscriptions/:id/refund - Operator refund
pub async fn refund_subscription(
    State(state): State<BillingAppState>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<String>,
    request: Option<Json<RefundSubscriptionRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = request.unwrap_or_default();
    let cmd = RefundSubscriptionCommand {
        operator: user,
        subscription_id: parse_subscription_id(&id)?,
        transaction_id: request.transaction_id,
    };

    let result = state.refund_handler().handle(cmd).await?;

    Ok(Json(RefundSubscriptionResponse::from(result)))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn parse_subscription_id(raw: &str) -> Result<SubscriptionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError(BillingError::Validation(format!("'{}' is not a subscription id", raw))))
}

// ════════════════════════════════════════════════════════════════════════════════
// Error Handling
// ════════════════════════════════════════════════════════════════════════════════

/// API error type that converts billing errors to HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub BillingError);

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let message = if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "Request failed");
            // retryable failures; details stay in the log
            match &self.0 {
                BillingError::StoreUnavailable(_) => "Store temporarily unavailable".to_string(),
                _ => "Internal error, retry the request".to_string(),
            }
        } else {
            tracing::debug!(error = %self.0, code = self.0.code(), "Request rejected");
            self.0.to_string()
        };

        (status, Json(ErrorResponse::new(self.0.code(), message))).into_response()
    }
}
