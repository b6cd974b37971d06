//! HandleStoreNotificationHandler - Command handler for store webhooks.
//!
//! Verifies and normalizes the payload, drops redeliveries, and routes the
//! event to the [`TransactionProcessor`]. Events that reference something
//! this system does not know are parked on the operator queue; an unknown
//! correlation key additionally triggers orphan recovery against the store.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::domain::billing::{
    BillingError, EventOutcome, EventSource, NormalizeOutcome, NormalizedEvent,
    NotificationNormalizer, RawNotification, Store, SubscriptionEvent, SubscriptionStatus,
};
use crate::domain::foundation::SubscriptionId;
use crate::ports::{
    AppendResult, Clock, LedgerStore, OperatorAlert, OperatorQueue, ProductCatalog,
    SubscriptionEventLog,
};

use super::processor::{PaymentEvent, ProcessOutcome, SubscriptionRef, TransactionProcessor};
use super::reconcile::Reconciler;

/// Command carrying one webhook delivery.
#[derive(Debug, Clone)]
pub struct HandleStoreNotificationCommand {
    pub store: Store,
    /// Raw request body.
    pub body: Vec<u8>,
    /// Signature header, for stores that sign outside the body.
    pub signature: Option<String>,
}

/// Result of webhook processing. Every variant is acknowledged with 2xx.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleStoreNotificationResult {
    Processed {
        subscription_id: SubscriptionId,
        status: SubscriptionStatus,
        outcome: EventOutcome,
        already_applied: bool,
    },
    /// The notification id was already logged.
    Duplicate { notification_id: String },
    /// Verified but not actionable.
    Unsupported { notification_type: String },
}

impl HandleStoreNotificationResult {
    fn processed(outcome: ProcessOutcome) -> Self {
        HandleStoreNotificationResult::Processed {
            subscription_id: outcome.subscription.id,
            status: outcome.subscription.status(),
            outcome: outcome.outcome,
            already_applied: outcome.already_applied,
        }
    }
}

pub struct HandleStoreNotificationHandler {
    normalizers: HashMap<Store, Arc<dyn NotificationNormalizer>>,
    processor: Arc<TransactionProcessor>,
    reconciler: Arc<Reconciler>,
    ledger: Arc<dyn LedgerStore>,
    event_log: Arc<dyn SubscriptionEventLog>,
    catalog: Arc<dyn ProductCatalog>,
    operator_queue: Arc<dyn OperatorQueue>,
    clock: Arc<dyn Clock>,
}

impl HandleStoreNotificationHandler {
    pub fn new(
        processor: Arc<TransactionProcessor>,
        reconciler: Arc<Reconciler>,
        ledger: Arc<dyn LedgerStore>,
        event_log: Arc<dyn SubscriptionEventLog>,
        catalog: Arc<dyn ProductCatalog>,
        operator_queue: Arc<dyn OperatorQueue>,
    ) -> Self {
        let clock = processor.clock().clone();
        Self {
            normalizers: HashMap::new(),
            processor,
            reconciler,
            ledger,
            event_log,
            catalog,
            operator_queue,
            clock,
        }
    }

    /// Registers the normalizer for its store, replacing any previous one.
    pub fn with_normalizer(mut self, normalizer: Arc<dyn NotificationNormalizer>) -> Self {
        self.normalizers.insert(normalizer.store(), normalizer);
        self
    }

    pub async fn handle(
        &self,
        cmd: HandleStoreNotificationCommand,
    ) -> Result<HandleStoreNotificationResult, BillingError> {
        // 1. Verify and normalize
        let normalizer = self.normalizers.get(&cmd.store).ok_or_else(|| {
            BillingError::StoreUnavailable(format!("no notification decoder configured for {}", cmd.store))
        })?;
        let now = self.clock.now();
        let mut raw = RawNotification::new(&cmd.body, now);
        if let Some(signature) = cmd.signature.as_deref() {
            raw = raw.with_signature(signature);
        }

        let event = match normalizer.normalize(raw) {
            Ok(NormalizeOutcome::Event(event)) => event,
            Ok(NormalizeOutcome::Unsupported {
                notification_type,
                notification_id,
            }) => return self.record_unsupported(cmd.store, notification_type, notification_id).await,
            Err(err) => {
                tracing::warn!(store = %cmd.store, error = %err, "Rejected store notification");
                return Err(err);
            }
        };

        // 2. Drop redeliveries
        if let Some(notification_id) = &event.notification_id {
            if self.event_log.find_by_notification_id(notification_id).await?.is_some() {
                tracing::debug!(
                    store = %event.store,
                    notification_id = %notification_id,
                    "Duplicate notification acknowledged"
                );
                return Ok(HandleStoreNotificationResult::Duplicate {
                    notification_id: notification_id.clone(),
                });
            }
        }

        // 3. Apply
        match self.route(&event).await {
            Ok(outcome) => {
                tracing::info!(
                    store = %event.store,
                    kind = %event.kind,
                    subscription_id = %outcome.subscription.id,
                    outcome = %outcome.outcome,
                    notification_id = ?event.notification_id,
                    "Store notification applied"
                );
                Ok(HandleStoreNotificationResult::processed(outcome))
            }
            Err(BillingError::DuplicateNotification(notification_id)) => {
                Ok(HandleStoreNotificationResult::Duplicate { notification_id })
            }
            Err(err) if err.is_referential_mismatch() => self.recover(&event, err).await,
            Err(err) => Err(err),
        }
    }

    async fn route(&self, event: &NormalizedEvent) -> Result<ProcessOutcome, BillingError> {
        if !event.kind.is_chargeable() {
            return self
                .processor
                .apply_lifecycle_event(
                    SubscriptionRef::Correlation(event.correlation.clone()),
                    event.clone(),
                    EventSource::Webhook,
                )
                .await;
        }

        let existing = self.ledger.find_live_by_correlation(&event.correlation).await?;

        let user_id = existing
            .as_ref()
            .map(|sub| sub.user_id.clone())
            .or_else(|| event.account_ref.clone())
            .ok_or_else(|| {
                BillingError::UserNotFound(format!("{} carries no account reference", event.correlation))
            })?;

        let by_store_id = match event.store_product_id.as_deref() {
            Some(store_product_id) => self
                .catalog
                .find_by_store_product(event.store, store_product_id)
                .await?
                .map(|product| product.id),
            None => None,
        };
        let product_id = by_store_id
            .or_else(|| existing.as_ref().map(|sub| sub.product_id.clone()))
            .ok_or_else(|| {
                BillingError::ProductNotFound(
                    event
                        .store_product_id
                        .clone()
                        .unwrap_or_else(|| event.correlation.to_string()),
                )
            })?;

        self.processor
            .apply_payment_event(PaymentEvent {
                user_id,
                product_id,
                event: event.clone(),
                source: EventSource::Webhook,
            })
            .await
    }

    /// Parks a referential mismatch and, for unknown correlation keys,
    /// tries to recover the subscription from the store once.
    async fn recover(
        &self,
        event: &NormalizedEvent,
        err: BillingError,
    ) -> Result<HandleStoreNotificationResult, BillingError> {
        tracing::warn!(
            store = %event.store,
            kind = %event.kind,
            correlation = %event.correlation,
            error = %err,
            "Store notification references unknown data"
        );

        let alert = OperatorAlert::from_error(event.store, event.kind.as_str(), &err, self.clock.now())
            .with_correlation_key(event.correlation.key())
            .with_notification_id(event.notification_id.clone())
            .with_payload(event.raw.clone());
        if let Err(queue_err) = self.operator_queue.push(alert).await {
            tracing::error!(error = %queue_err, "Failed to park notification on operator queue");
        }

        let unknown_key = match &err {
            BillingError::SubscriptionNotFound(_) => true,
            BillingError::UserNotFound(_) => self
                .ledger
                .find_live_by_correlation(&event.correlation)
                .await?
                .is_none(),
            _ => false,
        };
        if !unknown_key {
            return Err(err);
        }

        match self
            .reconciler
            .reconcile_orphan(
                &event.correlation,
                event.store_product_id.as_deref(),
                event.account_ref.clone(),
                event.event_time,
            )
            .await
        {
            Ok(recovered) => {
                tracing::info!(
                    correlation = %event.correlation,
                    subscription_id = %recovered.subscription.id,
                    "Orphaned subscription recovered"
                );
                let outcome = if event.kind.is_chargeable() {
                    self.route(event).await?
                } else {
                    self.processor
                        .apply_lifecycle_event(
                            SubscriptionRef::Id(recovered.subscription.id),
                            event.clone(),
                            EventSource::Webhook,
                        )
                        .await?
                };
                Ok(HandleStoreNotificationResult::processed(outcome))
            }
            Err(recovery_err) => {
                tracing::warn!(
                    correlation = %event.correlation,
                    error = %recovery_err,
                    "Orphan recovery failed"
                );
                Err(err)
            }
        }
    }

    async fn record_unsupported(
        &self,
        store: Store,
        notification_type: String,
        notification_id: Option<String>,
    ) -> Result<HandleStoreNotificationResult, BillingError> {
        let mut entry = SubscriptionEvent::system(
            format!("unsupported.{}", notification_type),
            EventSource::Webhook,
            json!({ "store": store.as_str(), "notification_type": notification_type }),
            self.clock.now(),
        );
        entry.notification_id = notification_id.clone();

        match self.event_log.append(entry).await? {
            AppendResult::DuplicateNotification => Ok(HandleStoreNotificationResult::Duplicate {
                notification_id: notification_id.unwrap_or_default(),
            }),
            AppendResult::Appended => {
                tracing::info!(
                    store = %store,
                    notification_type = %notification_type,
                    "Unsupported store notification acknowledged"
                );
                Ok(HandleStoreNotificationResult::Unsupported { notification_type })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::catalog::StaticProductCatalog;
    use crate::adapters::memory::{InMemoryLedgerStore, InMemoryOperatorQueue, ManualClock};
    use crate::adapters::stores::ScriptedStoreClient;
    use crate::domain::billing::notification::mobile_fixtures::{envelope, normalizer, purchase};
    use crate::domain::billing::{Product, StoreProductIds, StoreRef};
    use crate::domain::foundation::{Money, ProductId, Timestamp, UserId};
    use crate::ports::{StoreClients, StoreLifecycle, StorePaymentState, StoreSubscriptionState};
    use serde_json::Value;

    const START_MS: i64 = 1_700_000_000_000;
    const DAY_MS: i64 = 86_400_000;

    struct Fixture {
        ledger: Arc<InMemoryLedgerStore>,
        queue: Arc<InMemoryOperatorQueue>,
        store: ScriptedStoreClient,
        handler: HandleStoreNotificationHandler,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedgerStore::permissive());
        let queue = Arc::new(InMemoryOperatorQueue::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_unix_millis(START_MS).unwrap()));
        let catalog = Arc::new(
            StaticProductCatalog::from_products(vec![Product {
                id: ProductId::new("premium_monthly").unwrap(),
                name: "Premium".into(),
                billing_period_days: 30,
                price: Money::new(499, "EUR").unwrap(),
                store_product_ids: StoreProductIds {
                    mobile: Some("premium_monthly".into()),
                    app_store: None,
                    web: None,
                },
            }])
            .unwrap(),
        );
        let processor = Arc::new(TransactionProcessor::new(
            ledger.clone(),
            catalog.clone(),
            clock,
        ));
        let store = ScriptedStoreClient::new(Store::Mobile);
        let reconciler = Arc::new(Reconciler::new(
            processor.clone(),
            StoreClients::new().with(Arc::new(store.clone())),
            catalog.clone(),
        ));
        let handler = HandleStoreNotificationHandler::new(
            processor,
            reconciler,
            ledger.clone(),
            ledger.clone(),
            catalog,
            queue.clone(),
        )
        .with_normalizer(Arc::new(normalizer()));
        Fixture {
            ledger,
            queue,
            store,
            handler,
        }
    }

    fn mobile(body: Vec<u8>) -> HandleStoreNotificationCommand {
        HandleStoreNotificationCommand {
            store: Store::Mobile,
            body,
            signature: None,
        }
    }

    fn purchase_body(message_id: &str, order_id: &str, expiry_ms: i64) -> Vec<u8> {
        envelope(message_id, 4, "tok-1", &purchase(order_id, expiry_ms), START_MS)
    }

    #[tokio::test]
    async fn purchase_notification_opens_subscription() {
        let f = fixture();
        let result = f
            .handler
            .handle(mobile(purchase_body("m-1", "GPA.1", START_MS + 30 * DAY_MS)))
            .await
            .unwrap();

        match result {
            HandleStoreNotificationResult::Processed { status, already_applied, .. } => {
                assert_eq!(status, SubscriptionStatus::Active);
                assert!(!already_applied);
            }
            other => panic!("expected processed, got {:?}", other),
        }
        assert_eq!(f.ledger.payment_count().await, 1);
    }

    #[tokio::test]
    async fn redelivery_is_acknowledged_as_duplicate() {
        let f = fixture();
        let body = purchase_body("m-1", "GPA.1", START_MS + 30 * DAY_MS);
        f.handler.handle(mobile(body.clone())).await.unwrap();

        let result = f.handler.handle(mobile(body)).await.unwrap();

        assert_eq!(
            result,
            HandleStoreNotificationResult::Duplicate {
                notification_id: "m-1".into()
            }
        );
        assert_eq!(f.ledger.payment_count().await, 1);
    }

    #[tokio::test]
    async fn same_charge_under_new_message_id_is_already_applied() {
        let f = fixture();
        f.handler
            .handle(mobile(purchase_body("m-1", "GPA.1", START_MS + 30 * DAY_MS)))
            .await
            .unwrap();

        let result = f
            .handler
            .handle(mobile(purchase_body("m-2", "GPA.1", START_MS + 30 * DAY_MS)))
            .await
            .unwrap();

        assert!(matches!(
            result,
            HandleStoreNotificationResult::Processed { already_applied: true, .. }
        ));
        assert_eq!(f.ledger.payment_count().await, 1);
    }

    #[tokio::test]
    async fn unsupported_code_is_logged_once() {
        let f = fixture();
        let body = envelope("m-9", 8, "tok-1", &purchase("GPA.1", START_MS), START_MS);

        let first = f.handler.handle(mobile(body.clone())).await.unwrap();
        let second = f.handler.handle(mobile(body)).await.unwrap();

        assert!(matches!(first, HandleStoreNotificationResult::Unsupported { .. }));
        assert!(matches!(second, HandleStoreNotificationResult::Duplicate { .. }));
        assert_eq!(f.ledger.event_count().await, 1);
    }

    #[tokio::test]
    async fn tampered_payload_never_reaches_the_ledger() {
        let f = fixture();
        let mut body: Value =
            serde_json::from_slice(&purchase_body("m-1", "GPA.1", START_MS + 30 * DAY_MS)).unwrap();
        body["message"]["data"] = Value::String("bm90IGpzb24=".into());

        let err = f
            .handler
            .handle(mobile(body.to_string().into_bytes()))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::MalformedPayload(_)));
        assert_eq!(f.ledger.event_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_store_is_retryable() {
        let f = fixture();
        let err = f
            .handler
            .handle(HandleStoreNotificationCommand {
                store: Store::AppStore,
                body: b"{}".to_vec(),
                signature: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn renewal_for_unknown_token_is_parked_and_recovered() {
        let f = fixture();
        f.store.set_state(
            "tok-1",
            StoreSubscriptionState {
                lifecycle: StoreLifecycle::Active,
                expires_at: Timestamp::from_unix_millis(START_MS + 30 * DAY_MS).unwrap(),
                auto_renewing: true,
                payment_state: StorePaymentState::Received,
                grace_period_end: None,
                latest_transaction_id: Some("GPA.1".into()),
                amount: Some(Money::new(499, "EUR").unwrap()),
                account_ref: Some(UserId::new("user-1").unwrap()),
                store_product_id: Some("premium_monthly".into()),
            },
        );
        let cancel = envelope("m-3", 3, "tok-1", &purchase("GPA.1", START_MS + 30 * DAY_MS), START_MS);

        let result = f.handler.handle(mobile(cancel)).await.unwrap();

        match result {
            HandleStoreNotificationResult::Processed { status, .. } => {
                assert_eq!(status, SubscriptionStatus::PendingCancellation)
            }
            other => panic!("expected processed, got {:?}", other),
        }
        assert_eq!(f.queue.len(), 1);
        let live = f
            .ledger
            .find_live_by_correlation(&StoreRef::for_store(Store::Mobile, "tok-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.user_id.as_str(), "user-1");
    }

    #[tokio::test]
    async fn unrecoverable_orphan_stays_on_the_queue() {
        let f = fixture();
        let cancel = envelope("m-3", 3, "tok-404", &purchase("GPA.1", START_MS + 30 * DAY_MS), START_MS);

        let err = f.handler.handle(mobile(cancel)).await.unwrap_err();

        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
        let alerts = f.queue.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].correlation_key.as_deref(), Some("tok-404"));
        assert_eq!(alerts[0].notification_id.as_deref(), Some("m-3"));
    }
}
