//! First-party card gateway API client.
//!
//! Form-encoded REST API authenticated with a secret key. Subscriptions are
//! addressed by gateway subscription id.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::billing::{Store, StoreRef};
use crate::domain::foundation::{Money, Timestamp, UserId};
use crate::ports::{
    StoreBillingClient, StoreError, StoreLifecycle, StorePaymentState, StoreSubscriptionState,
};

use super::http::{build_client, check_status, json_body, transport_error};

#[derive(Debug, Clone)]
pub struct WebGatewayClientConfig {
    pub api_base_url: String,
    pub api_key: SecretString,
    pub timeout: Duration,
}

pub struct WebGatewayClient {
    config: WebGatewayClientConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GatewaySubscription {
    id: String,
    status: String,
    current_period_end: i64,
    #[serde(default)]
    cancel_at_period_end: bool,
    latest_invoice: Option<GatewayInvoice>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GatewayInvoice {
    id: String,
    amount_paid: i64,
    currency: String,
}

impl WebGatewayClient {
    pub fn new(config: WebGatewayClientConfig) -> Result<Self, StoreError> {
        let client = build_client(config.timeout)?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn subscription_id(correlation: &StoreRef) -> Result<&str, StoreError> {
        match correlation {
            StoreRef::GatewaySubscriptionId(id) => Ok(id),
            other => Err(StoreError::Unsupported(format!("{} is not a gateway subscription", other))),
        }
    }

    async fn send_form(
        &self,
        request: reqwest::RequestBuilder,
        form: &[(&str, &str)],
        key: &str,
    ) -> Result<(), StoreError> {
        let response = request
            .basic_auth(self.config.api_key.expose_secret(), Some(""))
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response, key).await?;
        Ok(())
    }
}

fn state_from(sub: GatewaySubscription) -> Result<StoreSubscriptionState, StoreError> {
    let expires_at = Timestamp::from_unix_secs(sub.current_period_end)
        .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;

    let lifecycle = match sub.status.as_str() {
        "active" | "trialing" => StoreLifecycle::Active,
        "past_due" => StoreLifecycle::InGracePeriod,
        "unpaid" => StoreLifecycle::OnHold,
        "paused" => StoreLifecycle::Paused,
        "canceled" | "incomplete_expired" => StoreLifecycle::Expired,
        other => {
            return Err(StoreError::InvalidResponse(format!(
                "subscription {} has unknown status {}",
                sub.id, other
            )))
        }
    };

    let payment_state = match sub.status.as_str() {
        "trialing" => StorePaymentState::FreeTrial,
        "past_due" | "unpaid" => StorePaymentState::Pending,
        _ => StorePaymentState::Received,
    };

    let (latest_transaction_id, amount) = match sub.latest_invoice {
        Some(invoice) if invoice.amount_paid > 0 => {
            let amount = Money::new(invoice.amount_paid, &invoice.currency).ok();
            (Some(invoice.id), amount)
        }
        _ => (None, None),
    };

    Ok(StoreSubscriptionState {
        lifecycle,
        expires_at,
        auto_renewing: !sub.cancel_at_period_end && lifecycle != StoreLifecycle::Expired,
        payment_state,
        grace_period_end: None,
        latest_transaction_id,
        amount,
        account_ref: sub.metadata.get("user_id").and_then(|id| UserId::new(id.as_str()).ok()),
        store_product_id: sub.metadata.get("product_id").cloned(),
    })
}

#[async_trait]
impl StoreBillingClient for WebGatewayClient {
    fn store(&self) -> Store {
        Store::Web
    }

    async fn validate_subscription(
        &self,
        _store_product_id: Option<&str>,
        correlation: &StoreRef,
    ) -> Result<StoreSubscriptionState, StoreError> {
        let id = Self::subscription_id(correlation)?;
        let response = self
            .client
            .get(self.url(&format!("/v1/subscriptions/{}", id)))
            .query(&[("expand[]", "latest_invoice")])
            .basic_auth(self.config.api_key.expose_secret(), Some(""))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, id).await?;
        state_from(json_body(response).await?)
    }

    async fn cancel(
        &self,
        _store_product_id: Option<&str>,
        correlation: &StoreRef,
        immediate: bool,
    ) -> Result<(), StoreError> {
        let id = Self::subscription_id(correlation)?;
        let url = self.url(&format!("/v1/subscriptions/{}", id));
        if immediate {
            self.send_form(self.client.delete(url), &[], id).await
        } else {
            self.send_form(self.client.post(url), &[("cancel_at_period_end", "true")], id)
                .await
        }
    }

    async fn refund(
        &self,
        _store_product_id: Option<&str>,
        _correlation: &StoreRef,
        transaction_id: &str,
    ) -> Result<(), StoreError> {
        self.send_form(
            self.client.post(self.url("/v1/refunds")),
            &[("invoice", transaction_id)],
            transaction_id,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> GatewaySubscription {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn active_subscription_with_paid_invoice() {
        let state = state_from(parse(
            r#"{"id":"sub_1","status":"active","current_period_end":1800000000,
                "latest_invoice":{"id":"in_1","amount_paid":499,"currency":"eur"},
                "metadata":{"user_id":"user-1","product_id":"premium_monthly"}}"#,
        ))
        .unwrap();

        assert_eq!(state.lifecycle, StoreLifecycle::Active);
        assert!(state.auto_renewing);
        assert_eq!(state.latest_transaction_id.as_deref(), Some("in_1"));
        assert_eq!(state.amount, Some(Money::new(499, "EUR").unwrap()));
        assert_eq!(state.account_ref, Some(UserId::new("user-1").unwrap()));
    }

    #[test]
    fn cancel_at_period_end_disables_auto_renew() {
        let state = state_from(parse(
            r#"{"id":"sub_1","status":"active","current_period_end":1800000000,"cancel_at_period_end":true}"#,
        ))
        .unwrap();
        assert!(!state.auto_renewing);
        assert!(state.latest_transaction_id.is_none());
    }

    #[test]
    fn past_due_is_grace_and_unknown_status_fails() {
        let grace = state_from(parse(r#"{"id":"s","status":"past_due","current_period_end":1800000000}"#)).unwrap();
        assert_eq!(grace.lifecycle, StoreLifecycle::InGracePeriod);
        assert!(state_from(parse(r#"{"id":"s","status":"weird","current_period_end":1800000000}"#)).is_err());
    }
}
