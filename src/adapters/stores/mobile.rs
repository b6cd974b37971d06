//! Mobile store server API client.
//!
//! Subscription purchases are looked up by product id and purchase token.
//! The API reports no explicit lifecycle, so it is derived from expiry,
//! payment state and the pause/cancel markers.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use crate::domain::billing::{Store, StoreRef};
use crate::domain::foundation::{Money, Timestamp, UserId};
use crate::ports::{
    StoreBillingClient, StoreError, StoreLifecycle, StorePaymentState, StoreSubscriptionState,
};

use super::http::{build_client, check_status, json_body, transport_error};

#[derive(Debug, Clone)]
pub struct MobileStoreClientConfig {
    pub api_base_url: String,
    pub package_name: String,
    /// OAuth bearer token for the publisher API.
    pub access_token: SecretString,
    pub timeout: Duration,
}

pub struct MobileStoreClient {
    config: MobileStoreClientConfig,
    client: Client,
}

/// Subset of the subscription purchase resource.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionPurchase {
    expiry_time_millis: String,
    #[serde(default)]
    auto_renewing: bool,
    /// 0 pending, 1 received, 2 free trial, 3 deferred upgrade.
    payment_state: Option<i64>,
    order_id: Option<String>,
    price_amount_micros: Option<String>,
    price_currency_code: Option<String>,
    obfuscated_external_account_id: Option<String>,
    auto_resume_time_millis: Option<String>,
    /// 0 user, 1 system (billing), 2 replaced, 3 developer.
    cancel_reason: Option<i64>,
}

impl MobileStoreClient {
    pub fn new(config: MobileStoreClientConfig) -> Result<Self, StoreError> {
        let client = build_client(config.timeout)?;
        Ok(Self { config, client })
    }

    fn token_url(&self, product_id: &str, token: &str) -> String {
        format!(
            "{}/androidpublisher/v3/applications/{}/purchases/subscriptions/{}/tokens/{}",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.package_name,
            product_id,
            token
        )
    }

    fn require_product(store_product_id: Option<&str>) -> Result<&str, StoreError> {
        store_product_id.ok_or_else(|| {
            StoreError::InvalidResponse("mobile store lookups need a store product id".into())
        })
    }

    fn require_token(correlation: &StoreRef) -> Result<&str, StoreError> {
        match correlation {
            StoreRef::PurchaseToken(token) => Ok(token),
            other => Err(StoreError::Unsupported(format!("{} is not a purchase token", other))),
        }
    }

    async fn post(&self, url: String, key: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(self.config.access_token.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, key).await?;
        Ok(())
    }

    fn to_state(purchase: SubscriptionPurchase, now: Timestamp) -> Result<StoreSubscriptionState, StoreError> {
        let millis = |s: &str| {
            s.parse::<i64>()
                .ok()
                .and_then(|m| Timestamp::from_unix_millis(m).ok())
                .ok_or_else(|| StoreError::InvalidResponse(format!("bad millisecond timestamp '{}'", s)))
        };
        let expires_at = millis(&purchase.expiry_time_millis)?;

        let payment_state = match purchase.payment_state {
            Some(2) => StorePaymentState::FreeTrial,
            Some(0) => StorePaymentState::Pending,
            _ => StorePaymentState::Received,
        };

        let lifecycle = if purchase.auto_resume_time_millis.is_some() {
            StoreLifecycle::Paused
        } else if expires_at <= now {
            StoreLifecycle::Expired
        } else if payment_state == StorePaymentState::Pending {
            StoreLifecycle::InGracePeriod
        } else {
            StoreLifecycle::Active
        };

        let amount = match (&purchase.price_amount_micros, &purchase.price_currency_code) {
            (Some(micros), Some(currency)) => micros
                .parse::<i64>()
                .ok()
                .and_then(|m| Money::from_micros(m, currency).ok()),
            _ => None,
        };

        Ok(StoreSubscriptionState {
            lifecycle,
            expires_at,
            auto_renewing: purchase.auto_renewing && purchase.cancel_reason.is_none(),
            payment_state,
            grace_period_end: (lifecycle == StoreLifecycle::InGracePeriod).then_some(expires_at),
            latest_transaction_id: purchase.order_id,
            amount,
            account_ref: purchase
                .obfuscated_external_account_id
                .and_then(|id| UserId::new(id).ok()),
            store_product_id: None,
        })
    }
}

#[async_trait]
impl StoreBillingClient for MobileStoreClient {
    fn store(&self) -> Store {
        Store::Mobile
    }

    async fn validate_subscription(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
    ) -> Result<StoreSubscriptionState, StoreError> {
        let product = Self::require_product(store_product_id)?;
        let token = Self::require_token(correlation)?;

        let response = self
            .client
            .get(self.token_url(product, token))
            .bearer_auth(self.config.access_token.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, token).await?;
        let purchase: SubscriptionPurchase = json_body(response).await?;

        let mut state = Self::to_state(purchase, Timestamp::now())?;
        state.store_product_id = Some(product.to_string());
        Ok(state)
    }

    async fn cancel(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
        immediate: bool,
    ) -> Result<(), StoreError> {
        let product = Self::require_product(store_product_id)?;
        let token = Self::require_token(correlation)?;
        let action = if immediate { "revoke" } else { "cancel" };
        self.post(format!("{}:{}", self.token_url(product, token), action), token)
            .await
    }

    async fn refund(
        &self,
        _store_product_id: Option<&str>,
        _correlation: &StoreRef,
        transaction_id: &str,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/androidpublisher/v3/applications/{}/orders/{}:refund",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.package_name,
            transaction_id
        );
        self.post(url, transaction_id).await
    }
}
