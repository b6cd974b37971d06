//! First-party web payment notifications from the card gateway.
//!
//! The gateway signs `"<timestamp>.<body>"` with HMAC-SHA256 and sends
//! `t=<timestamp>,v1=<hex signature>` in the `Gateway-Signature` header.
//! Events older than five minutes are rejected to stop replays.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::domain::billing::{BillingError, EventKind, Store, StoreRef};
use crate::domain::foundation::{Money, Timestamp, UserId};

use super::mac::{constant_time_eq, hmac_sha256};
use super::{required_str, NormalizeOutcome, NormalizedEvent, NotificationNormalizer, RawNotification};

/// Maximum allowed age for gateway events (5 minutes).
const MAX_EVENT_AGE_SECS: i64 = 300;

/// Maximum allowed clock skew for future events (1 minute).
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Parsed `Gateway-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySignatureHeader {
    pub timestamp: i64,
    /// Every `v1` entry; the gateway sends several during secret rotation.
    pub signatures: Vec<Vec<u8>>,
}

impl GatewaySignatureHeader {
    /// Parses `t=<timestamp>,v1=<hex>[,v1=<hex>...]`. Unknown keys are ignored.
    pub fn parse(header: &str) -> Result<Self, BillingError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .trim()
                .split_once('=')
                .ok_or_else(|| BillingError::InvalidSignature("invalid signature header".into()))?;
            match key {
                "t" => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| {
                        BillingError::InvalidSignature("invalid signature timestamp".into())
                    })?)
                }
                "v1" => signatures.push(hex::decode(value).map_err(|_| {
                    BillingError::InvalidSignature("signature is not hex".into())
                })?),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| BillingError::InvalidSignature("missing signature timestamp".into()))?;
        if signatures.is_empty() {
            return Err(BillingError::InvalidSignature("missing v1 signature".into()));
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

pub struct WebGatewayNormalizer {
    secret: SecretString,
}

impl WebGatewayNormalizer {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn verify(&self, raw: &RawNotification<'_>) -> Result<(), BillingError> {
        let header = raw
            .signature
            .ok_or_else(|| BillingError::InvalidSignature("missing signature header".into()))?;
        let header = GatewaySignatureHeader::parse(header)?;

        let age = raw.received_at.as_unix_secs() - header.timestamp;
        if age > MAX_EVENT_AGE_SECS || age < -MAX_CLOCK_SKEW_SECS {
            return Err(BillingError::InvalidSignature(format!(
                "signature timestamp outside tolerance ({}s)",
                age
            )));
        }

        let mut signed = header.timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(raw.body);
        let expected = hmac_sha256(self.secret.expose_secret().as_bytes(), &signed)?;

        if header
            .signatures
            .iter()
            .any(|candidate| constant_time_eq(&expected, candidate))
        {
            Ok(())
        } else {
            Err(BillingError::InvalidSignature("gateway signature mismatch".into()))
        }
    }
}

impl NotificationNormalizer for WebGatewayNormalizer {
    fn store(&self) -> Store {
        Store::Web
    }

    fn normalize(&self, raw: RawNotification<'_>) -> Result<NormalizeOutcome, BillingError> {
        self.verify(&raw)?;

        let envelope: Value = serde_json::from_slice(raw.body)
            .map_err(|e| BillingError::MalformedPayload(format!("gateway event: {}", e)))?;
        let event_id = required_str(&envelope, "/id")?.to_string();
        let event_type = required_str(&envelope, "/type")?.to_string();
        let created = secs_field(&envelope, "/created")?
            .ok_or_else(|| BillingError::MalformedPayload("missing created".into()))?;
        let object = envelope
            .pointer("/data/object")
            .ok_or_else(|| BillingError::MalformedPayload("missing data.object".into()))?;

        let built = match event_type.as_str() {
            "invoice.paid" => Some(invoice_paid(object, created)?),
            "invoice.payment_failed" => Some(payment_failed(object, created)?),
            "customer.subscription.updated" => renewal_toggle(&envelope, object, created)?,
            "customer.subscription.deleted" => Some(subscription_deleted(object, created)?),
            "charge.refunded" => Some(charge_refunded(object, created)?),
            _ => None,
        };

        Ok(match built {
            Some(mut event) => {
                event.notification_id = Some(event_id);
                event.raw = envelope;
                NormalizeOutcome::Event(event)
            }
            None => NormalizeOutcome::Unsupported {
                notification_type: event_type,
                notification_id: Some(event_id),
            },
        })
    }
}

fn secs_field(value: &Value, path: &str) -> Result<Option<Timestamp>, BillingError> {
    match value.pointer(path) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let secs = v
                .as_i64()
                .ok_or_else(|| BillingError::MalformedPayload(format!("{} is not unix seconds", path)))?;
            Timestamp::from_unix_secs(secs)
                .map(Some)
                .map_err(|e| BillingError::MalformedPayload(e.to_string()))
        }
    }
}

fn correlation(object: &Value, path: &str) -> Result<StoreRef, BillingError> {
    Ok(StoreRef::for_store(Store::Web, required_str(object, path)?)?)
}

fn account_ref(object: &Value) -> Option<UserId> {
    object
        .pointer("/metadata/user_id")
        .and_then(Value::as_str)
        .and_then(|id| UserId::new(id).ok())
}

fn invoice_paid(invoice: &Value, created: Timestamp) -> Result<NormalizedEvent, BillingError> {
    let kind = match invoice.get("billing_reason").and_then(Value::as_str) {
        Some("subscription_create") => EventKind::Purchased,
        _ => EventKind::Renewed,
    };
    let period_end = match secs_field(invoice, "/lines/data/0/period/end")? {
        Some(end) => end,
        None => secs_field(invoice, "/period_end")?
            .ok_or_else(|| BillingError::MalformedPayload("missing period end".into()))?,
    };
    let invoice_id = required_str(invoice, "/id")?;
    let amount = invoice
        .get("amount_paid")
        .and_then(Value::as_i64)
        .ok_or_else(|| BillingError::MalformedPayload("missing amount_paid".into()))?;
    let currency = required_str(invoice, "/currency")?;

    let mut event = NormalizedEvent::synthesized(kind, correlation(invoice, "/subscription")?, created)
        .with_expires_at(period_end)
        .with_auto_renewing(true)
        .with_transaction(invoice_id, Money::new(amount, currency)?);
    event.account_ref = account_ref(invoice);
    event.store_product_id = invoice
        .pointer("/metadata/product_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    event.is_trial = amount == 0;
    Ok(event)
}

fn payment_failed(invoice: &Value, created: Timestamp) -> Result<NormalizedEvent, BillingError> {
    let event = NormalizedEvent::synthesized(
        EventKind::GracePeriodEntered,
        correlation(invoice, "/subscription")?,
        created,
    )
    .with_grace_period_end(secs_field(invoice, "/next_payment_attempt")?);
    Ok(event)
}

/// Only a flip of `cancel_at_period_end` is a lifecycle signal.
fn renewal_toggle(
    envelope: &Value,
    subscription: &Value,
    created: Timestamp,
) -> Result<Option<NormalizedEvent>, BillingError> {
    let previous = envelope
        .pointer("/data/previous_attributes/cancel_at_period_end")
        .and_then(Value::as_bool);
    let current = subscription.get("cancel_at_period_end").and_then(Value::as_bool);

    let kind = match (previous, current) {
        (Some(false), Some(true)) => EventKind::Canceled,
        (Some(true), Some(false)) => EventKind::Restarted,
        _ => return Ok(None),
    };

    let mut event = NormalizedEvent::synthesized(kind, correlation(subscription, "/id")?, created)
        .with_auto_renewing(kind == EventKind::Restarted);
    event.expires_at = secs_field(subscription, "/current_period_end")?;
    Ok(Some(event))
}

fn subscription_deleted(subscription: &Value, created: Timestamp) -> Result<NormalizedEvent, BillingError> {
    Ok(
        NormalizedEvent::synthesized(EventKind::Expired, correlation(subscription, "/id")?, created)
            .with_auto_renewing(false),
    )
}

/// Charges are booked under their invoice id, so the refund is keyed the same way.
fn charge_refunded(charge: &Value, created: Timestamp) -> Result<NormalizedEvent, BillingError> {
    let charge_id = required_str(charge, "/id")?;
    let transaction_id = charge
        .get("invoice")
        .and_then(Value::as_str)
        .filter(|invoice| !invoice.is_empty())
        .unwrap_or(charge_id);
    let refunded = charge
        .get("amount_refunded")
        .and_then(Value::as_i64)
        .ok_or_else(|| BillingError::MalformedPayload("missing amount_refunded".into()))?;
    let currency = required_str(charge, "/currency")?;

    let mut event = NormalizedEvent::synthesized(
        EventKind::Revoked,
        correlation(charge, "/metadata/subscription_id")?,
        created,
    )
    .with_transaction(transaction_id, Money::new(refunded, currency)?);
    event.account_ref = account_ref(charge);
    Ok(event)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const SECRET: &str = "whsec_test_secret_12345";

    pub fn normalizer() -> WebGatewayNormalizer {
        WebGatewayNormalizer::new(SecretString::new(SECRET.into()))
    }

    pub fn sign(timestamp: i64, body: &str) -> String {
        let signed = format!("{}.{}", timestamp, body);
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(hmac_sha256(SECRET.as_bytes(), signed.as_bytes()).unwrap())
        )
    }
}
