//! Shared fixtures for the integration tests.
//!
//! Builds a fully wired billing service over the in-memory ledger and signs
//! store payloads the way each store does.

#![allow(dead_code)]

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use secrecy::SecretString;
use serde_json::{json, Value};
use sha2::Sha256;

use marketplace_billing::adapters::catalog::StaticProductCatalog;
use marketplace_billing::adapters::http::BillingAppState;
use marketplace_billing::adapters::memory::{InMemoryLedgerStore, InMemoryOperatorQueue, ManualClock};
use marketplace_billing::adapters::stores::ScriptedStoreClient;
use marketplace_billing::application::handlers::billing::{
    HandleStoreNotificationCommand, HandleStoreNotificationHandler, HandleStoreNotificationResult,
    Reconciler, TransactionProcessor,
};
use marketplace_billing::domain::billing::notification::{
    AppStoreNormalizer, AppStoreNormalizerConfig, MobileStoreNormalizer, MobileStoreNormalizerConfig,
    PinnedKeyVerifier, WebGatewayNormalizer,
};
use marketplace_billing::domain::billing::{BillingError, Store};
use marketplace_billing::domain::foundation::{Timestamp, UserId};
use marketplace_billing::ports::StoreClients;

pub const NOW_SECS: i64 = 1_700_000_000;
pub const DAY_MS: i64 = 86_400_000;

pub const PACKAGE: &str = "com.marketplace.app";
pub const MOBILE_KEY: &str = "mobile-signing-key";
pub const BUNDLE: &str = "com.marketplace.app";
pub const WEBHOOK_SECRET: &str = "whsec_integration";

pub const CATALOG: &str = r#"
products:
  - id: premium_monthly
    name: Premium (monthly)
    billing_period_days: 30
    price: { amount_minor: 499, currency: EUR }
    store_product_ids:
      mobile: premium_monthly
      appstore: com.marketplace.premium.monthly
      web: price_monthly
"#;

pub struct Harness {
    pub ledger: Arc<InMemoryLedgerStore>,
    pub queue: Arc<InMemoryOperatorQueue>,
    pub clock: Arc<ManualClock>,
    pub processor: Arc<TransactionProcessor>,
    pub reconciler: Arc<Reconciler>,
    pub mobile_store: ScriptedStoreClient,
    pub web_store: ScriptedStoreClient,
    pub notifications: Arc<HandleStoreNotificationHandler>,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::from_unix_secs(NOW_SECS).unwrap()));
        let ledger = Arc::new(InMemoryLedgerStore::permissive());
        let queue = Arc::new(InMemoryOperatorQueue::new());
        let catalog = Arc::new(StaticProductCatalog::from_yaml_str(CATALOG).unwrap());
        let processor = Arc::new(TransactionProcessor::new(
            ledger.clone(),
            catalog.clone(),
            clock.clone(),
        ));
        let mobile_store = ScriptedStoreClient::new(Store::Mobile);
        let web_store = ScriptedStoreClient::new(Store::Web);
        let clients = StoreClients::new()
            .with(Arc::new(mobile_store.clone()))
            .with(Arc::new(web_store.clone()));
        let reconciler = Arc::new(Reconciler::new(processor.clone(), clients, catalog.clone()));

        let notifications = HandleStoreNotificationHandler::new(
            processor.clone(),
            reconciler.clone(),
            ledger.clone(),
            ledger.clone(),
            catalog,
            queue.clone(),
        )
        .with_normalizer(Arc::new(MobileStoreNormalizer::new(MobileStoreNormalizerConfig {
            package_name: PACKAGE.into(),
            signing_key: SecretString::new(MOBILE_KEY.into()),
        })))
        .with_normalizer(Arc::new(AppStoreNormalizer::new(AppStoreNormalizerConfig {
            bundle_id: BUNDLE.into(),
            verifier: Arc::new(PinnedKeyVerifier::new(app_store_key().verifying_key().clone())),
        })))
        .with_normalizer(Arc::new(WebGatewayNormalizer::new(SecretString::new(
            WEBHOOK_SECRET.into(),
        ))));

        Self {
            ledger,
            queue,
            clock,
            processor,
            reconciler,
            mobile_store,
            web_store,
            notifications: Arc::new(notifications),
        }
    }

    pub fn now(&self) -> Timestamp {
        use marketplace_billing::ports::Clock;
        self.clock.now()
    }

    pub fn app_state(&self) -> BillingAppState {
        BillingAppState {
            ledger: self.ledger.clone(),
            operator_queue: self.queue.clone(),
            processor: self.processor.clone(),
            clients: StoreClients::new()
                .with(Arc::new(self.mobile_store.clone()))
                .with(Arc::new(self.web_store.clone())),
            notifications: self.notifications.clone(),
        }
    }

    /// Id of the user's only subscription.
    pub async fn ledger_subscription_id(&self) -> String {
        use marketplace_billing::ports::LedgerStore;
        let subs = self.ledger.list_for_user(&user()).await.unwrap();
        assert_eq!(subs.len(), 1);
        subs[0].id.to_string()
    }

    pub async fn deliver(
        &self,
        store: Store,
        body: Vec<u8>,
        signature: Option<String>,
    ) -> Result<HandleStoreNotificationResult, BillingError> {
        self.notifications
            .handle(HandleStoreNotificationCommand { store, body, signature })
            .await
    }
}

pub fn user() -> UserId {
    UserId::new("user-1").unwrap()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ════════════════════════════════════════════════════════════════════════════════
// Mobile store
// ════════════════════════════════════════════════════════════════════════════════

pub fn mobile_purchase(order_id: &str, expiry_millis: i64) -> Value {
    json!({
        "orderId": order_id,
        "startTimeMillis": (NOW_SECS * 1000).to_string(),
        "expiryTimeMillis": expiry_millis.to_string(),
        "autoRenewing": true,
        "priceAmountMicros": "4990000",
        "priceCurrencyCode": "EUR",
        "paymentState": 1,
        "obfuscatedExternalAccountId": "user-1"
    })
}

/// A push envelope carrying one signed purchase.
pub fn mobile_envelope(message_id: &str, code: i64, token: &str, purchase: &Value, event_millis: i64) -> Vec<u8> {
    let purchase_data = purchase.to_string();
    let signature = STANDARD.encode(hmac_sha256(MOBILE_KEY.as_bytes(), purchase_data.as_bytes()));
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
            "publishTime": "2023-11-14T22:13:20Z"
        },
        "subscription": "projects/marketplace/subscriptions/billing"
    })
    .to_string()
    .into_bytes()
}

// ════════════════════════════════════════════════════════════════════════════════
// App store
// ════════════════════════════════════════════════════════════════════════════════

pub fn app_store_key() -> SigningKey {
    SigningKey::from_slice(&[7u8; 32]).unwrap()
}

fn jws(payload: &Value) -> String {
    let header = json!({"alg": "ES256", "x5c": [STANDARD.encode([0x30, 0x82, 0x01])]});
    let input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    );
    let signature: Signature = app_store_key().sign(input.as_bytes());
    format!("{}.{}", input, URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

pub fn app_store_transaction(original_id: &str, transaction_id: &str, expires_millis: i64) -> Value {
    json!({
        "originalTransactionId": original_id,
        "transactionId": transaction_id,
        "productId": "com.marketplace.premium.monthly",
        "expiresDate": expires_millis,
        "price": 4990,
        "currency": "EUR",
        "appAccountToken": "user-1"
    })
}

pub fn app_store_body(
    notification_type: &str,
    subtype: Option<&str>,
    uuid: &str,
    signed_date: i64,
    transaction: &Value,
    renewal: Option<&Value>,
) -> Vec<u8> {
    let mut data = json!({
        "bundleId": BUNDLE,
        "environment": "Production",
        "signedTransactionInfo": jws(transaction),
    });
    if let Some(renewal) = renewal {
        data["signedRenewalInfo"] = json!(jws(renewal));
    }
    let mut payload = json!({
        "notificationType": notification_type,
        "notificationUUID": uuid,
        "signedDate": signed_date,
        "data": data,
    });
    if let Some(subtype) = subtype {
        payload["subtype"] = json!(subtype);
    }
    json!({ "signedPayload": jws(&payload) }).to_string().into_bytes()
}

// ════════════════════════════════════════════════════════════════════════════════
// Web gateway
// ════════════════════════════════════════════════════════════════════════════════

pub fn gateway_signature(timestamp: i64, body: &str) -> String {
    let signed = format!("{}.{}", timestamp, body);
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(hmac_sha256(WEBHOOK_SECRET.as_bytes(), signed.as_bytes()))
    )
}

pub fn invoice_paid(event_id: &str, invoice_id: &str, subscription: &str, reason: &str, created: i64, period_end: i64) -> String {
    json!({
        "id": event_id,
        "type": "invoice.paid",
        "created": created,
        "data": {"object": {
            "id": invoice_id,
            "subscription": subscription,
            "billing_reason": reason,
            "amount_paid": 499,
            "currency": "eur",
            "lines": {"data": [{"period": {"start": created, "end": period_end}}]},
            "metadata": {"user_id": "user-1", "product_id": "price_monthly"}
        }}
    })
    .to_string()
}

pub fn charge_refunded(event_id: &str, charge_id: &str, invoice_id: &str, subscription: &str, created: i64) -> String {
    json!({
        "id": event_id,
        "type": "charge.refunded",
        "created": created,
        "data": {"object": {
            "id": charge_id,
            "invoice": invoice_id,
            "amount_refunded": 499,
            "currency": "eur",
            "metadata": {"subscription_id": subscription, "user_id": "user-1"}
        }}
    })
    .to_string()
}
