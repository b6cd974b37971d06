//! CancelSubscriptionHandler - Command handler for user-initiated cancellation.

use std::sync::Arc;

use crate::domain::billing::{
    BillingError, Entitlement, EventKind, EventSource, NormalizedEvent, Subscription,
};
use crate::domain::foundation::{AuthenticatedUser, StateMachine, SubscriptionId, Timestamp};
use crate::ports::{LedgerStore, StoreClients};

use super::processor::{SubscriptionRef, TransactionProcessor};

/// Command to cancel a subscription.
#[derive(Debug, Clone)]
pub struct CancelSubscriptionCommand {
    pub user: AuthenticatedUser,
    pub subscription_id: SubscriptionId,
    /// End entitlement now instead of at period end.
    pub immediate: bool,
}

/// Result of successful cancellation.
#[derive(Debug, Clone)]
pub struct CancelSubscriptionResult {
    pub subscription: Subscription,
    /// When access ends.
    pub effective_at: Timestamp,
    pub entitlement: Option<Entitlement>,
}

/// Handler for cancelling subscriptions.
///
/// The store is told first; the ledger only records a cancellation the
/// store accepted. Without `immediate` the user keeps access until the
/// current period ends.
pub struct CancelSubscriptionHandler {
    ledger: Arc<dyn LedgerStore>,
    processor: Arc<TransactionProcessor>,
    clients: StoreClients,
}

impl CancelSubscriptionHandler {
    pub fn new(ledger: Arc<dyn LedgerStore>, processor: Arc<TransactionProcessor>, clients: StoreClients) -> Self {
        Self {
            ledger,
            processor,
            clients,
        }
    }

    pub async fn handle(&self, cmd: CancelSubscriptionCommand) -> Result<CancelSubscriptionResult, BillingError> {
        // 1. Find the subscription and check ownership
        let subscription = self
            .ledger
            .find_subscription(&cmd.subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(cmd.subscription_id.to_string()))?;
        if subscription.user_id != cmd.user.id {
            return Err(BillingError::Forbidden(format!(
                "subscription {} belongs to another user",
                subscription.id
            )));
        }

        let kind = if cmd.immediate {
            EventKind::CanceledImmediately
        } else {
            EventKind::Canceled
        };
        if subscription.status().is_terminal() || !subscription.is_live() {
            return Err(BillingError::InvalidTransition {
                from: subscription.status(),
                kind,
            });
        }

        // 2. Cancel with the store
        let client = self.clients.require(subscription.store)?;
        client
            .cancel(
                subscription.store_product_id.as_deref(),
                &subscription.correlation,
                cmd.immediate,
            )
            .await
            .map_err(BillingError::from)?;

        // 3. Record it
        let now = self.processor.clock().now();
        let event = NormalizedEvent::synthesized(kind, subscription.correlation.clone(), now)
            .with_auto_renewing(false);
        let outcome = self
            .processor
            .apply_lifecycle_event(SubscriptionRef::Id(subscription.id), event, EventSource::UserAction)
            .await?;

        tracing::info!(
            subscription_id = %outcome.subscription.id,
            user_id = %cmd.user.id,
            immediate = cmd.immediate,
            status = %outcome.subscription.status(),
            "Subscription cancelled"
        );

        Ok(CancelSubscriptionResult {
            effective_at: outcome.subscription.effective_end(),
            subscription: outcome.subscription,
            entitlement: outcome.entitlement,
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
    use crate::domain::foundation::{Money, ProductId, UserId};
    use crate::ports::StoreError;

    struct Fixture {
        ledger: Arc<InMemoryLedgerStore>,
        store: ScriptedStoreClient,
        processor: Arc<TransactionProcessor>,
        handler: CancelSubscriptionHandler,
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
        let handler = CancelSubscriptionHandler::new(
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

    fn owner() -> AuthenticatedUser {
        AuthenticatedUser::new(UserId::new("user-1").unwrap(), vec![])
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
                user_id: owner().id,
                product_id: ProductId::new("premium_monthly").unwrap(),
                event,
                source: EventSource::Webhook,
            })
            .await
            .unwrap()
            .subscription
    }

    #[tokio::test]
    async fn cancel_keeps_access_until_period_end() {
        let f = fixture();
        let sub = subscribe(&f).await;

        let result = f
            .handler
            .handle(CancelSubscriptionCommand {
                user: owner(),
                subscription_id: sub.id,
                immediate: false,
            })
            .await
            .unwrap();

        assert_eq!(result.subscription.status(), SubscriptionStatus::PendingCancellation);
        assert_eq!(result.effective_at, f.now.plus_days(30));
        assert!(result.entitlement.map(|e| e.is_entitled).unwrap_or(false));
        assert_eq!(
            f.store.calls(),
            vec![StoreCall::Cancel {
                key: "sub_1".into(),
                immediate: false
            }]
        );
    }

    #[tokio::test]
    async fn immediate_cancel_ends_access_now() {
        let f = fixture();
        let sub = subscribe(&f).await;

        let result = f
            .handler
            .handle(CancelSubscriptionCommand {
                user: owner(),
                subscription_id: sub.id,
                immediate: true,
            })
            .await
            .unwrap();

        assert_eq!(result.subscription.status(), SubscriptionStatus::Canceled);
        assert_eq!(result.subscription.current_period_end, f.now);
        assert!(!result.entitlement.map(|e| e.is_entitled).unwrap_or(true));
    }

    #[tokio::test]
    async fn other_users_cannot_cancel() {
        let f = fixture();
        let sub = subscribe(&f).await;
        let intruder = AuthenticatedUser::new(UserId::new("user-2").unwrap(), vec![]);

        let err = f
            .handler
            .handle(CancelSubscriptionCommand {
                user: intruder,
                subscription_id: sub.id,
                immediate: false,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Forbidden(_)));
        assert!(f.store.calls().is_empty());
    }

    #[tokio::test]
    async fn store_refusal_leaves_ledger_untouched() {
        let f = fixture();
        let sub = subscribe(&f).await;
        f.store.fail_once(
            "sub_1",
            StoreError::Rejected {
                status: 400,
                message: "already canceled".into(),
            },
        );

        let err = f
            .handler
            .handle(CancelSubscriptionCommand {
                user: owner(),
                subscription_id: sub.id,
                immediate: false,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::StoreRejected(_)));
        let current = f.ledger.find_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(current.status(), SubscriptionStatus::Active);
        assert!(current.auto_renewing);
    }
}
