//! App store server API client.
//!
//! Requests are authenticated with a short-lived ES256 JWT signed by the
//! team's API key. Subscription status responses embed the same signed
//! transaction and renewal JWS used by notifications, and are verified the
//! same way before any field is read.

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::billing::notification::{decode_verified, JwsVerifier};
use crate::domain::billing::{Store, StoreRef};
use crate::domain::foundation::{Money, Timestamp, UserId};
use crate::ports::{
    StoreBillingClient, StoreError, StoreLifecycle, StorePaymentState, StoreSubscriptionState,
};

use super::http::{build_client, check_status, json_body, transport_error};

/// Bearer tokens may live at most one hour; keep them short.
const TOKEN_TTL_SECS: i64 = 20 * 60;
const AUDIENCE: &str = "appstoreconnect-v1";

#[derive(Clone)]
pub struct AppStoreClientConfig {
    pub api_base_url: String,
    pub bundle_id: String,
    pub issuer_id: String,
    pub key_id: String,
    /// PKCS#8 PEM of the API signing key.
    pub private_key_pem: SecretString,
    /// Verifies the JWS embedded in API responses.
    pub verifier: Arc<dyn JwsVerifier>,
    pub timeout: Duration,
}

pub struct AppStoreClient {
    config: AppStoreClientConfig,
    encoding_key: EncodingKey,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ApiClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'a str,
    bid: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    #[serde(default)]
    data: Vec<SubscriptionGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionGroup {
    #[serde(default)]
    last_transactions: Vec<LastTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastTransaction {
    original_transaction_id: String,
    /// 1 active, 2 expired, 3 billing retry, 4 grace period, 5 revoked.
    status: i64,
    signed_transaction_info: String,
    signed_renewal_info: Option<String>,
}

impl AppStoreClient {
    pub fn new(config: AppStoreClientConfig) -> Result<Self, StoreError> {
        let encoding_key = EncodingKey::from_ec_pem(config.private_key_pem.expose_secret().as_bytes())
            .map_err(|e| StoreError::Unsupported(format!("invalid app store API key: {}", e)))?;
        let client = build_client(config.timeout)?;
        Ok(Self {
            config,
            encoding_key,
            client,
        })
    }

    fn bearer_token(&self, now: Timestamp) -> Result<String, StoreError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());
        let claims = ApiClaims {
            iss: &self.config.issuer_id,
            iat: now.as_unix_secs(),
            exp: now.as_unix_secs() + TOKEN_TTL_SECS,
            aud: AUDIENCE,
            bid: &self.config.bundle_id,
        };
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| StoreError::Unsupported(format!("failed to sign API token: {}", e)))
    }

    fn decode(&self, token: &str) -> Result<Value, StoreError> {
        decode_verified(token, self.config.verifier.as_ref())
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    fn to_state(&self, last: &LastTransaction) -> Result<StoreSubscriptionState, StoreError> {
        let transaction = self.decode(&last.signed_transaction_info)?;
        let renewal = last
            .signed_renewal_info
            .as_deref()
            .map(|token| self.decode(token))
            .transpose()?;
        state_from(last.status, &transaction, renewal.as_ref())
    }
}

fn millis(value: &Value, field: &str) -> Option<Timestamp> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .and_then(|m| Timestamp::from_unix_millis(m).ok())
}

fn state_from(
    status: i64,
    transaction: &Value,
    renewal: Option<&Value>,
) -> Result<StoreSubscriptionState, StoreError> {
    let lifecycle = match status {
        1 => StoreLifecycle::Active,
        2 => StoreLifecycle::Expired,
        3 => StoreLifecycle::OnHold,
        4 => StoreLifecycle::InGracePeriod,
        5 => StoreLifecycle::Revoked,
        other => {
            return Err(StoreError::InvalidResponse(format!("unknown subscription status {}", other)))
        }
    };

    let expires_at = millis(transaction, "expiresDate")
        .ok_or_else(|| StoreError::InvalidResponse("transaction without expiresDate".into()))?;

    let is_trial = transaction.get("offerDiscountType").and_then(Value::as_str) == Some("FREE_TRIAL");
    let amount = match (
        transaction.get("price").and_then(Value::as_i64),
        transaction.get("currency").and_then(Value::as_str),
    ) {
        (Some(price), Some(currency)) => Money::from_millis(price, currency).ok(),
        _ => None,
    };

    Ok(StoreSubscriptionState {
        lifecycle,
        expires_at,
        auto_renewing: renewal
            .and_then(|r| r.get("autoRenewStatus"))
            .and_then(Value::as_i64)
            .map(|s| s == 1)
            .unwrap_or(false),
        payment_state: if is_trial {
            StorePaymentState::FreeTrial
        } else {
            StorePaymentState::Received
        },
        grace_period_end: renewal.and_then(|r| millis(r, "gracePeriodExpiresDate")),
        latest_transaction_id: transaction
            .get("transactionId")
            .and_then(Value::as_str)
            .map(str::to_string),
        amount,
        account_ref: transaction
            .get("appAccountToken")
            .and_then(Value::as_str)
            .and_then(|t| UserId::new(t).ok()),
        store_product_id: transaction
            .get("productId")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl StoreBillingClient for AppStoreClient {
    fn store(&self) -> Store {
        Store::AppStore
    }

    async fn validate_subscription(
        &self,
        _store_product_id: Option<&str>,
        correlation: &StoreRef,
    ) -> Result<StoreSubscriptionState, StoreError> {
        let original_id = match correlation {
            StoreRef::OriginalTransactionId(id) => id.as_str(),
            other => {
                return Err(StoreError::Unsupported(format!(
                    "{} is not an original transaction id",
                    other
                )))
            }
        };

        let url = format!(
            "{}/inApps/v1/subscriptions/{}",
            self.config.api_base_url.trim_end_matches('/'),
            original_id
        );
        let response = self
            .client
            .get(url)
            .bearer_auth(self.bearer_token(Timestamp::now())?)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, original_id).await?;
        let body: StatusResponse = json_body(response).await?;

        let last = body
            .data
            .iter()
            .flat_map(|group| group.last_transactions.iter())
            .find(|t| t.original_transaction_id == original_id)
            .ok_or_else(|| StoreError::NotFound(original_id.to_string()))?;

        self.to_state(last)
    }

    async fn cancel(
        &self,
        _store_product_id: Option<&str>,
        _correlation: &StoreRef,
        _immediate: bool,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported(
            "app store subscriptions can only be cancelled by the subscriber".into(),
        ))
    }

    async fn refund(
        &self,
        _store_product_id: Option<&str>,
        _correlation: &StoreRef,
        _transaction_id: &str,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("app store refunds are granted by the store".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transaction(expires_ms: i64) -> Value {
        json!({
            "originalTransactionId": "1000",
            "transactionId": "1005",
            "productId": "com.marketplace.premium.monthly",
            "expiresDate": expires_ms,
            "price": 4990,
            "currency": "EUR",
            "appAccountToken": "user-1"
        })
    }

    #[test]
    fn maps_status_codes_to_lifecycle() {
        let expires = 1_800_000_000_000;
        assert_eq!(state_from(1, &transaction(expires), None).unwrap().lifecycle, StoreLifecycle::Active);
        assert_eq!(state_from(3, &transaction(expires), None).unwrap().lifecycle, StoreLifecycle::OnHold);
        assert_eq!(state_from(5, &transaction(expires), None).unwrap().lifecycle, StoreLifecycle::Revoked);
        assert!(state_from(9, &transaction(expires), None).is_err());
    }

    #[test]
    fn reads_renewal_info() {
        let renewal = json!({"autoRenewStatus": 1, "gracePeriodExpiresDate": 1_800_100_000_000i64});
        let state = state_from(4, &transaction(1_800_000_000_000), Some(&renewal)).unwrap();
        assert!(state.auto_renewing);
        assert_eq!(
            state.grace_period_end,
            Some(Timestamp::from_unix_millis(1_800_100_000_000).unwrap())
        );
        assert_eq!(state.amount, Some(Money::new(499, "EUR").unwrap()));
        assert_eq!(state.latest_transaction_id.as_deref(), Some("1005"));
    }

    #[test]
    fn missing_expiry_is_invalid() {
        let tx = json!({"originalTransactionId": "1000"});
        assert!(matches!(state_from(1, &tx, None), Err(StoreError::InvalidResponse(_))));
    }

    #[test]
    fn decodes_status_response() {
        let body = r#"{"data":[{"subscriptionGroupIdentifier":"g","lastTransactions":[
            {"originalTransactionId":"1000","status":1,"signedTransactionInfo":"a.b.c"}]}]}"#;
        let parsed: StatusResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data[0].last_transactions[0].status, 1);
    }
}
