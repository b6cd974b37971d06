//! Mobile-store notification adapter.
//!
//! Notifications arrive as a push envelope whose `message.data` is a
//! base64 developer notification. The developer notification carries the
//! numeric notification type plus an inner signed purchase
//! (`signedPurchase.purchaseData` with a base64 HMAC-SHA256 signature).
//! Both layers are decoded and the inner signature is verified before any
//! purchase field is read.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use crate::domain::billing::{BillingError, EventKind, Store, StoreRef};
use crate::domain::foundation::{Money, UserId};

use super::mac::{constant_time_eq, hmac_sha256};
use super::{
    millis_field, required_str, NormalizeOutcome, NormalizedEvent, NotificationNormalizer,
    RawNotification,
};

/// Payment state reported for a subscription in its free trial.
const PAYMENT_STATE_FREE_TRIAL: i64 = 2;

#[derive(Clone)]
pub struct MobileStoreNormalizerConfig {
    /// Application package the notifications must belong to.
    pub package_name: String,
    /// Key the store uses to sign `purchaseData`.
    pub signing_key: SecretString,
}

pub struct MobileStoreNormalizer {
    config: MobileStoreNormalizerConfig,
}

impl MobileStoreNormalizer {
    pub fn new(config: MobileStoreNormalizerConfig) -> Self {
        Self { config }
    }

    /// Maps the store's numeric subscription notification type.
    ///
    /// On-hold (5) means the grace window closed without payment, so it
    /// revokes entitlement like an expiry. Price-change confirmations (8),
    /// deferrals (9) and pause-schedule edits (11) do not change status and
    /// are left to reconciliation.
    pub fn kind_for_code(code: i64) -> Option<EventKind> {
        match code {
            1 => Some(EventKind::Recovered),
            2 => Some(EventKind::Renewed),
            3 => Some(EventKind::Canceled),
            4 => Some(EventKind::Purchased),
            5 => Some(EventKind::Expired),
            6 => Some(EventKind::GracePeriodEntered),
            7 => Some(EventKind::Restarted),
            10 => Some(EventKind::Paused),
            12 => Some(EventKind::Revoked),
            13 => Some(EventKind::Expired),
            _ => None,
        }
    }

    fn decode_envelope(&self, body: &[u8]) -> Result<(String, Value), BillingError> {
        let envelope: Value = serde_json::from_slice(body)
            .map_err(|e| BillingError::MalformedPayload(format!("push envelope: {}", e)))?;

        let message_id = required_str(&envelope, "/message/messageId")?.to_string();
        let data = required_str(&envelope, "/message/data")?;

        let decoded = STANDARD
            .decode(data)
            .map_err(|_| BillingError::MalformedPayload("message.data is not base64".into()))?;
        let notification: Value = serde_json::from_slice(&decoded)
            .map_err(|e| BillingError::MalformedPayload(format!("developer notification: {}", e)))?;

        Ok((message_id, notification))
    }

    fn verify_purchase(&self, notification: &Value) -> Result<Value, BillingError> {
        let purchase_data = required_str(notification, "/signedPurchase/purchaseData")?;
        let signature = required_str(notification, "/signedPurchase/signature")?;

        let provided = STANDARD
            .decode(signature)
            .map_err(|_| BillingError::InvalidSignature("purchase signature is not base64".into()))?;
        let expected = hmac_sha256(
            self.config.signing_key.expose_secret().as_bytes(),
            purchase_data.as_bytes(),
        )?;
        if !constant_time_eq(&expected, &provided) {
            return Err(BillingError::InvalidSignature(
                "purchase signature mismatch".into(),
            ));
        }

        serde_json::from_str(purchase_data)
            .map_err(|e| BillingError::MalformedPayload(format!("purchaseData: {}", e)))
    }
}

impl NotificationNormalizer for MobileStoreNormalizer {
    fn store(&self) -> Store {
        Store::Mobile
    }

    fn normalize(&self, raw: RawNotification<'_>) -> Result<NormalizeOutcome, BillingError> {
        let (message_id, notification) = self.decode_envelope(raw.body)?;

        let package = required_str(&notification, "/packageName")?;
        if package != self.config.package_name {
            return Err(BillingError::MalformedPayload(format!(
                "notification for unknown package {}",
                package
            )));
        }

        if notification.get("testNotification").is_some() {
            return Ok(NormalizeOutcome::Unsupported {
                notification_type: "test".into(),
                notification_id: Some(message_id),
            });
        }
        if notification.get("subscriptionNotification").is_none() {
            return Ok(NormalizeOutcome::Unsupported {
                notification_type: "non_subscription".into(),
                notification_id: Some(message_id),
            });
        }

        let purchase = self.verify_purchase(&notification)?;

        let code = notification
            .pointer("/subscriptionNotification/notificationType")
            .and_then(Value::as_i64)
            .ok_or_else(|| BillingError::MalformedPayload("missing notificationType".into()))?;
        let purchase_token = required_str(&notification, "/subscriptionNotification/purchaseToken")?;
        let subscription_id = required_str(&notification, "/subscriptionNotification/subscriptionId")?;
        let expires_at = millis_field(&purchase, "/expiryTimeMillis")?
            .ok_or_else(|| BillingError::MalformedPayload("missing expiryTimeMillis".into()))?;
        let event_time = millis_field(&notification, "/eventTimeMillis")?
            .ok_or_else(|| BillingError::MalformedPayload("missing eventTimeMillis".into()))?;

        let Some(kind) = Self::kind_for_code(code) else {
            return Ok(NormalizeOutcome::Unsupported {
                notification_type: format!("subscription:{}", code),
                notification_id: Some(message_id),
            });
        };

        let correlation = StoreRef::for_store(Store::Mobile, purchase_token)?;
        let is_trial =
            purchase.get("paymentState").and_then(Value::as_i64) == Some(PAYMENT_STATE_FREE_TRIAL);

        let mut event = NormalizedEvent::synthesized(kind, correlation, event_time)
            .with_expires_at(expires_at)
            .with_raw(json!({ "notification": notification, "purchase": purchase }));
        event.notification_id = Some(message_id);
        event.store_product_id = Some(subscription_id.to_string());
        event.auto_renewing = purchase.get("autoRenewing").and_then(Value::as_bool);
        event.is_trial = is_trial;
        event.account_ref = purchase
            .get("obfuscatedExternalAccountId")
            .and_then(Value::as_str)
            .and_then(|id| UserId::new(id).ok());

        // Without an explicit grace end the store has already extended the
        // expiry to the end of the grace window.
        if kind == EventKind::GracePeriodEntered {
            let grace_end = millis_field(&purchase, "/gracePeriodEndTimeMillis")?;
            event.grace_period_end = Some(grace_end.unwrap_or(expires_at));
        }

        if kind.is_chargeable() && !is_trial {
            if let (Some(order_id), Some(amount)) = (
                purchase.get("orderId").and_then(Value::as_str),
                price_of(&purchase)?,
            ) {
                event = event.with_transaction(order_id, amount);
            }
        }

        Ok(NormalizeOutcome::Event(event))
    }
}

fn price_of(purchase: &Value) -> Result<Option<Money>, BillingError> {
    let micros = match purchase.get("priceAmountMicros") {
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    };
    let currency = purchase.get("priceCurrencyCode").and_then(Value::as_str);
    match (micros, currency) {
        (Some(micros), Some(currency)) => Ok(Some(Money::from_micros(micros, currency)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const PACKAGE: &str = "com.marketplace.app";
    pub const KEY: &str = "mobile-signing-key";

    pub fn normalizer() -> MobileStoreNormalizer {
        MobileStoreNormalizer::new(MobileStoreNormalizerConfig {
            package_name: PACKAGE.into(),
            signing_key: SecretString::new(KEY.into()),
        })
    }

    /// Builds a push envelope the way the store delivers it.
    pub fn envelope(message_id: &str, code: i64, token: &str, purchase: &Value, event_millis: i64) -> Vec<u8> {
        let purchase_data = purchase.to_string();
        let signature = STANDARD.encode(hmac_sha256(KEY.as_bytes(), purchase_data.as_bytes()).unwrap());
        let notification = json!({
            "version": "1.0",
            "packageName": PACKAGE,
            "eventTimeMillis": event_millis.to_string(),
            "subscriptionNotification": {
                "version": "1.0",
                "notificationType": code,
                "purchaseToken": token,
                "subscriptionId": "premium_monthly"
            },
            "signedPurchase": { "purchaseData": purchase_data, "signature": signature }
        });
        json!({
            "message": {
                "data": STANDARD.encode(notification.to_string()),
                "messageId": message_id,
                "publishTime": "2024-01-01T00:00:00Z"
            },
            "subscription": "projects/marketplace/subscriptions/billing"
        })
        .to_string()
        .into_bytes()
    }

    pub fn purchase(order_id: &str, expiry_millis: i64) -> Value {
        json!({
            "orderId": order_id,
            "startTimeMillis": "1700000000000",
            "expiryTimeMillis": expiry_millis.to_string(),
            "autoRenewing": true,
            "priceAmountMicros": "4990000",
            "priceCurrencyCode": "EUR",
            "paymentState": 1,
            "obfuscatedExternalAccountId": "user-1"
        })
    }
}
