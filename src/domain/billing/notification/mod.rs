//! Store notification normalization.
//!
//! Each billing platform sends differently shaped, differently signed
//! payloads. Every adapter here is a pure function from raw bytes to a
//! [`NormalizedEvent`]; nothing downstream sees store-specific JSON.
//!
//! - `mobile` - push envelope with an HMAC-signed inner purchase
//! - `app_store` - ES256 JWS with nested signed transaction/renewal info
//! - `web` - first-party card gateway events (`t=..,v1=..` signatures)

mod app_store;
mod jws;
mod mac;
mod mobile;
mod web;

pub use app_store::{AppStoreNormalizer, AppStoreNormalizerConfig};
pub use jws::{JwsVerifier, PinnedKeyVerifier};
pub(crate) use jws::decode_verified;
pub use mobile::{MobileStoreNormalizer, MobileStoreNormalizerConfig};
pub use web::{GatewaySignatureHeader, WebGatewayNormalizer};

#[cfg(test)]
pub(crate) use mobile::test_support as mobile_fixtures;
#[cfg(test)]
pub(crate) use web::test_support as web_fixtures;

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{Money, Timestamp, UserId};

use super::{BillingError, EventKind, Store, StoreRef};

/// One notification as received over HTTP.
#[derive(Debug, Clone, Copy)]
pub struct RawNotification<'a> {
    pub body: &'a [u8],
    /// Transport-level signature header, for stores that use one.
    pub signature: Option<&'a str>,
    pub received_at: Timestamp,
}

impl<'a> RawNotification<'a> {
    pub fn new(body: &'a [u8], received_at: Timestamp) -> Self {
        Self {
            body,
            signature: None,
            received_at,
        }
    }

    pub fn with_signature(mut self, signature: &'a str) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// Canonical, store-independent form of a lifecycle signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub store: Store,
    pub correlation: StoreRef,
    /// Store-issued id used for webhook deduplication.
    pub notification_id: Option<String>,
    pub store_product_id: Option<String>,
    /// Store-reported time of the event; drives the stale-event tie-break.
    pub event_time: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub grace_period_end: Option<Timestamp>,
    pub auto_renewing: Option<bool>,
    /// Store transaction id; present when the event moved money.
    pub transaction_id: Option<String>,
    pub amount: Option<Money>,
    pub is_trial: bool,
    /// Account reference the purchase was made with, if the store echoes it.
    pub account_ref: Option<UserId>,
    pub raw: serde_json::Value,
}

impl NormalizedEvent {
    /// Creates an internally generated event (reconciliation, sweep, user action).
    pub fn synthesized(kind: EventKind, correlation: StoreRef, event_time: Timestamp) -> Self {
        Self {
            kind,
            store: correlation.store(),
            correlation,
            notification_id: None,
            store_product_id: None,
            event_time,
            expires_at: None,
            grace_period_end: None,
            auto_renewing: None,
            transaction_id: None,
            amount: None,
            is_trial: false,
            account_ref: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_expires_at(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_grace_period_end(mut self, end: Option<Timestamp>) -> Self {
        self.grace_period_end = end;
        self
    }

    pub fn with_auto_renewing(mut self, auto_renewing: bool) -> Self {
        self.auto_renewing = Some(auto_renewing);
        self
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>, amount: Money) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self.amount = Some(amount);
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    /// True when the event moved money and must produce a payment record.
    pub fn has_financial_impact(&self) -> bool {
        self.transaction_id.is_some()
            && self.amount.as_ref().map(|a| !a.is_zero()).unwrap_or(false)
    }
}

/// Result of normalizing a verified notification.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Event(NormalizedEvent),
    /// Verified but not actionable (test pings, price-change notices).
    Unsupported {
        notification_type: String,
        notification_id: Option<String>,
    },
}

/// A store-specific decoder.
pub trait NotificationNormalizer: Send + Sync {
    fn store(&self) -> Store;

    /// Verifies and decodes one notification.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if any signature layer fails verification
    /// - `MalformedPayload` if the payload cannot be decoded or is incomplete
    fn normalize(&self, raw: RawNotification<'_>) -> Result<NormalizeOutcome, BillingError>;
}

/// Reads a required string field, reporting the path on failure.
pub(crate) fn required_str<'v>(
    value: &'v serde_json::Value,
    path: &str,
) -> Result<&'v str, BillingError> {
    value
        .pointer(path)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BillingError::MalformedPayload(format!("missing field {}", path)))
}

/// Reads a millisecond timestamp that stores send as either a JSON number or a string.
pub(crate) fn millis_field(
    value: &serde_json::Value,
    path: &str,
) -> Result<Option<Timestamp>, BillingError> {
    let millis = match value.pointer(path) {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
        Some(_) => None,
    }
    .ok_or_else(|| BillingError::MalformedPayload(format!("{} is not a millisecond timestamp", path)))?;

    Timestamp::from_unix_millis(millis)
        .map(Some)
        .map_err(|e| BillingError::MalformedPayload(e.to_string()))
}
