//! RefundSubscriptionHandler - Command handler for operator refunds.

use std::sync::Arc;

use crate::domain::billing::{
    BillingError, EventKind, EventSource, NormalizedEvent, PaymentRecord, PaymentStatus,
    Subscription, TransactionType,
};
use crate::domain::foundation::{AuthenticatedUser, SubscriptionId};
use crate::ports::{LedgerStore, StoreClients};

use super::processor::{SubscriptionRef, TransactionProcessor};

/// Command to refund the latest charge of a subscription and revoke it.
#[derive(Debug, Clone)]
pub struct RefundSubscriptionCommand {
    pub operator: AuthenticatedUser,
    pub subscription_id: SubscriptionId,
    /// Charge to refund; the most recent completed charge when absent.
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundSubscriptionResult {
    pub subscription: Subscription,
    /// The negative refund record, or the existing one on replay.
    pub refund: Option<PaymentRecord>,
    pub already_applied: bool,
}

/// Handler for operator refunds.
///
/// Requires the admin role. The store refunds first; the ledger then
/// books a negative `refund` record keyed on the charge and revokes the
/// subscription in one unit.
pub struct RefundSubscriptionHandler {
    ledger: Arc<dyn LedgerStore>,
    processor: Arc<TransactionProcessor>,
    clients: StoreClients,
}

impl RefundSubscriptionHandler {
    pub fn new(ledger: Arc<dyn LedgerStore>, processor: Arc<TransactionProcessor>, clients: StoreClients) -> Self {
        Self {
            ledger,
            processor,
            clients,
        }
    }

    pub async fn handle(&self, cmd: RefundSubscriptionCommand) -> Result<RefundSubscriptionResult, BillingError> {
        if !cmd.operator.is_admin() {
            return Err(BillingError::Forbidden("refunds require the admin role".into()));
        }

        // 1. Find the subscription and the charge to refund
        let subscription = self
            .ledger
            .find_subscription(&cmd.subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(cmd.subscription_id.to_string()))?;

        let payments = self.ledger.list_payments(&subscription.id).await?;
        let charge = payments
            .iter()
            .filter(|p| p.transaction_type == TransactionType::Charge && p.status == PaymentStatus::Completed)
            .filter(|p| match cmd.transaction_id.as_deref() {
                Some(id) => p.key.store_transaction_id == id,
                None => true,
            })
            .max_by_key(|p| p.transaction_date)
            .ok_or_else(|| {
                BillingError::Validation(format!("subscription {} has no refundable charge", subscription.id))
            })?;

        // 2. Refund with the store
        let client = self.clients.require(subscription.store)?;
        client
            .refund(
                subscription.store_product_id.as_deref(),
                &subscription.correlation,
                &charge.key.store_transaction_id,
            )
            .await
            .map_err(BillingError::from)?;

        // 3. Book the refund and revoke
        let now = self.processor.clock().now();
        let event = NormalizedEvent::synthesized(EventKind::Revoked, subscription.correlation.clone(), now)
            .with_transaction(charge.key.store_transaction_id.clone(), charge.amount.clone());
        let outcome = self
            .processor
            .apply_lifecycle_event(SubscriptionRef::Id(subscription.id), event, EventSource::Operator)
            .await?;

        tracing::info!(
            subscription_id = %outcome.subscription.id,
            operator_id = %cmd.operator.id,
            transaction_id = %charge.key.store_transaction_id,
            already_applied = outcome.already_applied,
            "Subscription refunded"
        );

        Ok(RefundSubscriptionResult {
            subscription: outcome.subscription,
            refund: outcome.payment_record,
            already_applied: outcome.already_applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::catalog::StaticProductCatalog;
    use crate::adapters::memory::{InMemoryLedgerStore, ManualClock};
    use crate::adapters::stores::{ScriptedStoreClient, StoreCall};
    use crate::application::handlers::billing::PaymentEvent;
    use crate::domain::billing::{Product, Store, StoreProductIds, StoreRef, SubscriptionStatus};
    use crate::domain::foundation::{Money, ProductId, Timestamp, UserId, ADMIN_ROLE};

    struct Fixture {
        ledger: Arc<InMemoryLedgerStore>,
        store: ScriptedStoreClient,
        processor: Arc<TransactionProcessor>,
        handler: RefundSubscriptionHandler,
        now: Timestamp,
    }

    fn fixture() -> Fixture {
        let now = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let ledger = Arc::new(InMemoryLedgerStore::permissive());
        let catalog = Arc::new(
            StaticProductCatalog::from_products(vec![Product {
                id: ProductId::new("premium_monthly").unwrap(),
                name: "Premium".into(),
                billing_period_days: 30,
                price: Money::new(499, "EUR").unwrap(),
                store_product_ids: StoreProductIds::default(),
            }])
            .unwrap(),
        );
        let processor = Arc::new(TransactionProcessor::new(
            ledger.clone(),
            catalog,
            Arc::new(ManualClock::new(now)),
        ));
        let store = ScriptedStoreClient::new(Store::Web);
        let handler = RefundSubscriptionHandler::new(
            ledger.clone(),
            processor.clone(),
            StoreClients::new().with(Arc::new(store.clone())),
        );
        Fixture {
            ledger,
            store,
            processor,
            handler,
            now,
        }
    }

    fn admin() -> AuthenticatedUser {
        AuthenticatedUser::new(UserId::new("ops-1").unwrap(), vec![ADMIN_ROLE.to_string()])
    }

    async fn subscribe(f: &Fixture) -> Subscription {
        let event = NormalizedEvent::synthesized(
            EventKind::Purchased,
            StoreRef::for_store(Store::Web, "sub_1").unwrap(),
            f.now,
        )
        .with_expires_at(f.now.plus_days(30))
        .with_transaction("in_1", Money::new(499, "EUR").unwrap());
        f.processor
            .apply_payment_event(PaymentEvent {
                user_id: UserId::new("user-1").unwrap(),
                product_id: ProductId::new("premium_monthly").unwrap(),
                event,
                source: EventSource::Webhook,
            })
            .await
            .unwrap()
            .subscription
    }

    fn refund_cmd(operator: AuthenticatedUser, subscription_id: SubscriptionId) -> RefundSubscriptionCommand {
        RefundSubscriptionCommand {
            operator,
            subscription_id,
            transaction_id: None,
        }
    }

    #[tokio::test]
    async fn refund_books_negative_record_and_revokes() {
        let f = fixture();
        let sub = subscribe(&f).await;

        let result = f.handler.handle(refund_cmd(admin(), sub.id)).await.unwrap();

        assert_eq!(result.subscription.status(), SubscriptionStatus::Refunded);
        let refund = result.refund.unwrap();
        assert_eq!(refund.transaction_type, TransactionType::Refund);
        assert_eq!(refund.amount.amount_minor, -499);
        assert_eq!(f.ledger.payment_count().await, 2);
        assert_eq!(
            f.store.calls(),
            vec![StoreCall::Refund {
                key: "sub_1".into(),
                transaction_id: "in_1".into()
            }]
        );
    }

    #[tokio::test]
    async fn non_admins_are_refused() {
        let f = fixture();
        let sub = subscribe(&f).await;
        let user = AuthenticatedUser::new(UserId::new("user-1").unwrap(), vec![]);

        let err = f.handler.handle(refund_cmd(user, sub.id)).await.unwrap_err();

        assert!(matches!(err, BillingError::Forbidden(_)));
        assert!(f.store.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_charge_is_a_validation_error() {
        let f = fixture();
        let sub = subscribe(&f).await;
        let mut cmd = refund_cmd(admin(), sub.id);
        cmd.transaction_id = Some("in_missing".into());

        let err = f.handler.handle(cmd).await.unwrap_err();

        assert!(matches!(err, BillingError::Validation(_)));
    }
}
