//! App-store notification adapter.
//!
//! The body is `{"signedPayload": "<JWS>"}`. The outer JWS and the nested
//! `signedTransactionInfo` / `signedRenewalInfo` JWS are each verified
//! before use. Notification type and subtype together select the event
//! kind; the subtype is what separates "renewal failed, grace granted"
//! from "renewal failed, expired".

use std::sync::Arc;

use serde_json::{json, Value};

use crate::domain::billing::{BillingError, EventKind, Store, StoreRef};
use crate::domain::foundation::{Money, UserId};

use super::jws::{decode_verified, JwsVerifier};
use super::{
    millis_field, required_str, NormalizeOutcome, NormalizedEvent, NotificationNormalizer,
    RawNotification,
};

#[derive(Clone)]
pub struct AppStoreNormalizerConfig {
    pub bundle_id: String,
    pub verifier: Arc<dyn JwsVerifier>,
}

pub struct AppStoreNormalizer {
    config: AppStoreNormalizerConfig,
}

impl AppStoreNormalizer {
    pub fn new(config: AppStoreNormalizerConfig) -> Self {
        Self { config }
    }

    /// Maps a notification type and optional subtype to an event kind.
    pub fn kind_for(notification_type: &str, subtype: Option<&str>) -> Option<EventKind> {
        match (notification_type, subtype) {
            ("SUBSCRIBED", _) => Some(EventKind::Purchased),
            ("DID_RENEW", Some("BILLING_RECOVERY")) => Some(EventKind::Recovered),
            ("DID_RENEW", _) => Some(EventKind::Renewed),
            ("DID_FAIL_TO_RENEW", Some("GRACE_PERIOD")) => Some(EventKind::GracePeriodEntered),
            ("DID_FAIL_TO_RENEW", _) => Some(EventKind::Expired),
            ("DID_CHANGE_RENEWAL_STATUS", Some("AUTO_RENEW_DISABLED")) => Some(EventKind::Canceled),
            ("DID_CHANGE_RENEWAL_STATUS", Some("AUTO_RENEW_ENABLED")) => Some(EventKind::Restarted),
            ("EXPIRED", _) | ("GRACE_PERIOD_EXPIRED", _) => Some(EventKind::Expired),
            ("REFUND", _) | ("REVOKE", _) => Some(EventKind::Revoked),
            _ => None,
        }
    }

    fn decode_nested(&self, payload: &Value, path: &str) -> Result<Option<Value>, BillingError> {
        match payload.pointer(path).and_then(Value::as_str) {
            Some(token) => decode_verified(token, self.config.verifier.as_ref()).map(Some),
            None => Ok(None),
        }
    }
}

impl NotificationNormalizer for AppStoreNormalizer {
    fn store(&self) -> Store {
        Store::AppStore
    }

    fn normalize(&self, raw: RawNotification<'_>) -> Result<NormalizeOutcome, BillingError> {
        let body: Value = serde_json::from_slice(raw.body)
            .map_err(|e| BillingError::MalformedPayload(format!("body: {}", e)))?;
        let signed_payload = required_str(&body, "/signedPayload")?;

        let payload = decode_verified(signed_payload, self.config.verifier.as_ref())?;

        let notification_type = required_str(&payload, "/notificationType")?.to_string();
        let subtype = payload.get("subtype").and_then(Value::as_str).map(str::to_string);
        let notification_id = required_str(&payload, "/notificationUUID")?.to_string();

        if let Some(bundle) = payload.pointer("/data/bundleId").and_then(Value::as_str) {
            if bundle != self.config.bundle_id {
                return Err(BillingError::MalformedPayload(format!(
                    "notification for unknown bundle {}",
                    bundle
                )));
            }
        }

        let Some(kind) = Self::kind_for(&notification_type, subtype.as_deref()) else {
            return Ok(NormalizeOutcome::Unsupported {
                notification_type: match &subtype {
                    Some(s) => format!("{}/{}", notification_type, s),
                    None => notification_type,
                },
                notification_id: Some(notification_id),
            });
        };

        let transaction = self
            .decode_nested(&payload, "/data/signedTransactionInfo")?
            .ok_or_else(|| BillingError::MalformedPayload("missing signedTransactionInfo".into()))?;
        let renewal = self.decode_nested(&payload, "/data/signedRenewalInfo")?;

        let original_transaction_id = required_str(&transaction, "/originalTransactionId")?;
        let event_time = millis_field(&payload, "/signedDate")?
            .ok_or_else(|| BillingError::MalformedPayload("missing signedDate".into()))?;
        let expires_at = millis_field(&transaction, "/expiresDate")?;
        if kind.is_chargeable() && expires_at.is_none() {
            return Err(BillingError::MalformedPayload("missing expiresDate".into()));
        }

        let correlation = StoreRef::for_store(Store::AppStore, original_transaction_id)?;
        let mut event = NormalizedEvent::synthesized(kind, correlation, event_time);
        event.notification_id = Some(notification_id);
        event.expires_at = expires_at;
        event.store_product_id = transaction
            .get("productId")
            .and_then(Value::as_str)
            .map(str::to_string);
        event.account_ref = transaction
            .get("appAccountToken")
            .and_then(Value::as_str)
            .and_then(|token| UserId::new(token).ok());
        event.is_trial =
            transaction.get("offerDiscountType").and_then(Value::as_str) == Some("FREE_TRIAL");

        if let Some(renewal) = &renewal {
            event.auto_renewing = renewal
                .get("autoRenewStatus")
                .and_then(Value::as_i64)
                .map(|status| status == 1);
            event.grace_period_end = millis_field(renewal, "/gracePeriodExpiresDate")?;
        }

        let carries_money = kind.is_chargeable() || kind == EventKind::Revoked;
        if carries_money && !event.is_trial {
            let transaction_id = transaction.get("transactionId").and_then(Value::as_str);
            let price = transaction.get("price").and_then(Value::as_i64);
            let currency = transaction.get("currency").and_then(Value::as_str);
            if let (Some(id), Some(price), Some(currency)) = (transaction_id, price, currency) {
                event = event.with_transaction(id, Money::from_millis(price, currency)?);
            }
        }

        event.raw = json!({
            "notification": payload,
            "transaction": transaction,
            "renewal": renewal,
        });

        Ok(NormalizeOutcome::Event(event))
    }
}
