//! Read-side handlers for the billing API.

use std::sync::Arc;

use crate::domain::billing::{BillingError, Entitlement, PaymentRecord, Subscription};
use crate::domain::foundation::{AuthenticatedUser, UserId};
use crate::ports::{Clock, LedgerStore, OperatorAlert, OperatorQueue};

/// Query for the caller's entitlement.
#[derive(Debug, Clone)]
pub struct GetEntitlementQuery {
    pub user_id: UserId,
}

/// Returns the stored projection, recomputing it when it would grant past its end.
pub struct GetEntitlementHandler {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl GetEntitlementHandler {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    pub async fn handle(&self, query: GetEntitlementQuery) -> Result<Entitlement, BillingError> {
        let now = self.clock.now();
        match self.ledger.get_entitlement(&query.user_id).await? {
            Some(stored) if !stored.is_entitled || stored.expires_at.map(|end| end > now).unwrap_or(false) => {
                Ok(stored)
            }
            _ => {
                let subscriptions = self.ledger.list_for_user(&query.user_id).await?;
                Ok(Entitlement::project(&query.user_id, &subscriptions, now))
            }
        }
    }
}

/// Query for the caller's subscriptions.
#[derive(Debug, Clone)]
pub struct ListSubscriptionsQuery {
    pub user_id: UserId,
    /// Include rows replaced by a newer row for the same store key.
    pub include_superseded: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub payments: Vec<PaymentRecord>,
}

pub struct ListSubscriptionsHandler {
    ledger: Arc<dyn LedgerStore>,
}

impl ListSubscriptionsHandler {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub async fn handle(&self, query: ListSubscriptionsQuery) -> Result<Vec<SubscriptionView>, BillingError> {
        let subscriptions = self.ledger.list_for_user(&query.user_id).await?;
        let mut views = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions
            .into_iter()
            .filter(|s| query.include_superseded || s.is_live())
        {
            let payments = self.ledger.list_payments(&subscription.id).await?;
            views.push(SubscriptionView { subscription, payments });
        }
        Ok(views)
    }
}

/// Query for parked notifications. Admin only.
#[derive(Debug, Clone)]
pub struct ListOperatorAlertsQuery {
    pub operator: AuthenticatedUser,
    pub limit: usize,
}

pub struct ListOperatorAlertsHandler {
    queue: Arc<dyn OperatorQueue>,
}

impl ListOperatorAlertsHandler {
    pub fn new(queue: Arc<dyn OperatorQueue>) -> Self {
        Self { queue }
    }

    pub async fn handle(&self, query: ListOperatorAlertsQuery) -> Result<Vec<OperatorAlert>, BillingError> {
        if !query.operator.is_admin() {
            return Err(BillingError::Forbidden("the operator queue requires the admin role".into()));
        }
        Ok(self.queue.list_open(query.limit.clamp(1, 500)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryLedgerStore, InMemoryOperatorQueue, ManualClock};
    use crate::domain::billing::{NewSubscription, Store, StoreRef};
    use crate::domain::foundation::{Money, ProductId, Timestamp};
    use crate::ports::LedgerWrite;

    fn user() -> UserId {
        UserId::new("user-1").unwrap()
    }

    async fn seeded(now: Timestamp, period_days: i64) -> Arc<InMemoryLedgerStore> {
        let ledger = Arc::new(InMemoryLedgerStore::permissive());
        let sub = Subscription::open(
            NewSubscription {
                user_id: user(),
                product_id: ProductId::new("premium_monthly").unwrap(),
                store_product_id: None,
                correlation: StoreRef::for_store(Store::Web, "sub_1").unwrap(),
                price: Money::new(499, "EUR").unwrap(),
                period_end: now.plus_days(period_days),
                is_trial: false,
                auto_renewing: true,
                event_time: now,
                supersedes: None,
            },
            now,
        );
        ledger
            .commit(LedgerWrite::new(user(), now).insert(sub))
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn returns_stored_projection_while_valid() {
        let now = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let ledger = seeded(now, 30).await;
        let handler = GetEntitlementHandler::new(ledger, Arc::new(ManualClock::new(now)));

        let entitlement = handler.handle(GetEntitlementQuery { user_id: user() }).await.unwrap();

        assert!(entitlement.is_entitled);
        assert_eq!(entitlement.expires_at, Some(now.plus_days(30)));
    }

    #[tokio::test]
    async fn lapsed_projection_is_recomputed() {
        let now = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let ledger = seeded(now, 30).await;
        let clock = ManualClock::new(now);
        clock.advance_days(31);
        let handler = GetEntitlementHandler::new(ledger, Arc::new(clock));

        let entitlement = handler.handle(GetEntitlementQuery { user_id: user() }).await.unwrap();

        assert!(!entitlement.is_entitled);
    }

    #[tokio::test]
    async fn unknown_user_is_not_entitled() {
        let now = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let handler = GetEntitlementHandler::new(
            Arc::new(InMemoryLedgerStore::permissive()),
            Arc::new(ManualClock::new(now)),
        );
        let entitlement = handler
            .handle(GetEntitlementQuery {
                user_id: UserId::new("nobody").unwrap(),
            })
            .await
            .unwrap();
        assert!(!entitlement.is_entitled);
    }

    #[tokio::test]
    async fn lists_live_subscriptions_with_payments() {
        let now = Timestamp::from_unix_secs(1_700_000_000).unwrap();
        let ledger = seeded(now, 30).await;
        let handler = ListSubscriptionsHandler::new(ledger);

        let views = handler
            .handle(ListSubscriptionsQuery {
                user_id: user(),
                include_superseded: false,
            })
            .await
            .unwrap();

        assert_eq!(views.len(), 1);
        assert!(views[0].payments.is_empty());
    }

    #[tokio::test]
    async fn operator_alerts_require_admin() {
        let handler = ListOperatorAlertsHandler::new(Arc::new(InMemoryOperatorQueue::new()));
        let err = handler
            .handle(ListOperatorAlertsQuery {
                operator: AuthenticatedUser::new(user(), vec![]),
                limit: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
    }
}
