//! Billing HTTP adapter.
//!
//! Exposes:
//! - store webhooks (`/webhooks/*`)
//! - the user and operator billing API (`/api/billing/*`)

mod dto;
mod handlers;
mod routes;

pub use dto::*;
pub use handlers::{health, ApiError, BillingAppState, GATEWAY_SIGNATURE_HEADER};
pub use routes::{billing_router, billing_routes, webhook_routes};
