//! In-memory ledger and event log.
//!
//! Same atomicity contract as the PostgreSQL adapter: every commit is staged
//! on a copy of the state and swapped in only when every write succeeded.
//! Used by tests and by local runs without a database.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::billing::{
    Entitlement, PaymentKey, PaymentRecord, StoreRef, Subscription, SubscriptionEvent,
    SubscriptionStatus,
};
use crate::domain::foundation::{DomainError, ErrorCode, SubscriptionId, UserId};
use crate::ports::{
    AppendResult, CommitOutcome, LedgerStore, LedgerWrite, SubscriptionEventLog, SubscriptionWrite,
};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    users: HashSet<UserId>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    payments: HashMap<PaymentKey, PaymentRecord>,
    events: Vec<SubscriptionEvent>,
    notification_ids: HashSet<String>,
    entitlements: HashMap<UserId, Entitlement>,
}

impl LedgerState {
    fn live_rows_for<'a>(&'a self, correlation: &'a StoreRef) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.subscriptions
            .values()
            .filter(move |s| s.is_live() && &s.correlation == correlation)
    }
}

/// In-memory [`LedgerStore`] and [`SubscriptionEventLog`].
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
    accept_any_user: bool,
    fail_next_payment_insert: Arc<AtomicBool>,
}

impl InMemoryLedgerStore {
    /// Store that only knows users added with [`register_user`](Self::register_user).
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            accept_any_user: false,
            fail_next_payment_insert: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Store that treats every user id as existing (local runs).
    pub fn permissive() -> Self {
        Self {
            accept_any_user: true,
            ..Self::new()
        }
    }

    pub async fn register_user(&self, user_id: UserId) {
        self.state.write().await.users.insert(user_id);
    }

    /// Makes the next commit carrying a payment record fail after its
    /// subscription writes were staged.
    pub fn fail_next_payment_insert(&self) {
        self.fail_next_payment_insert.store(true, Ordering::SeqCst);
    }

    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.read().await.subscriptions.len()
    }

    pub async fn all_events(&self) -> Vec<SubscriptionEvent> {
        self.state.read().await.events.clone()
    }

    fn stage_subscription(staged: &mut LedgerState, write: SubscriptionWrite) -> Result<(), DomainError> {
        match write {
            SubscriptionWrite::Insert(mut subscription) => {
                if staged.subscriptions.contains_key(&subscription.id) {
                    return Err(DomainError::new(
                        ErrorCode::ConcurrentModification,
                        format!("subscription {} already exists", subscription.id),
                    ));
                }
                subscription.version = 1;
                staged.subscriptions.insert(subscription.id, subscription);
            }
            SubscriptionWrite::Update {
                mut subscription,
                expected_version,
            } => {
                let current = staged.subscriptions.get(&subscription.id).ok_or_else(|| {
                    DomainError::new(
                        ErrorCode::SubscriptionNotFound,
                        format!("subscription {} not found", subscription.id),
                    )
                })?;
                if current.version != expected_version {
                    return Err(DomainError::new(
                        ErrorCode::ConcurrentModification,
                        format!(
                            "subscription {} is at version {}, expected {}",
                            subscription.id, current.version, expected_version
                        ),
                    ));
                }
                subscription.version = expected_version + 1;
                staged.subscriptions.insert(subscription.id, subscription);
            }
        }
        Ok(())
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn find_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, DomainError> {
        Ok(self.state.read().await.subscriptions.get(id).cloned())
    }

    async fn find_live_by_correlation(&self, correlation: &StoreRef) -> Result<Option<Subscription>, DomainError> {
        let state = self.state.read().await;
        let found = state.live_rows_for(correlation).next().cloned();
        Ok(found)
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Subscription>, DomainError> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| &s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn list_by_status(
        &self,
        statuses: &[SubscriptionStatus],
        after: Option<SubscriptionId>,
        limit: usize,
    ) -> Result<Vec<Subscription>, DomainError> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .subscriptions
            .values()
            .filter(|s| s.is_live() && statuses.contains(&s.status()))
            .filter(|s| after.map(|a| s.id > a).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.id);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_payment(&self, key: &PaymentKey) -> Result<Option<PaymentRecord>, DomainError> {
        Ok(self.state.read().await.payments.get(key).cloned())
    }

    async fn list_payments(&self, subscription_id: &SubscriptionId) -> Result<Vec<PaymentRecord>, DomainError> {
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .payments
            .values()
            .filter(|p| &p.subscription_id == subscription_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.created_at);
        Ok(rows)
    }

    async fn get_entitlement(&self, user_id: &UserId) -> Result<Option<Entitlement>, DomainError> {
        Ok(self.state.read().await.entitlements.get(user_id).cloned())
    }

    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, DomainError> {
        let mut state = self.state.write().await;

        if !self.accept_any_user && !state.users.contains(&write.user_id) {
            return Err(DomainError::new(
                ErrorCode::UserNotFound,
                format!("user {} not found", write.user_id),
            ));
        }

        for event in &write.events {
            if let Some(id) = &event.notification_id {
                if state.notification_ids.contains(id) {
                    return Ok(CommitOutcome::DuplicateNotification(id.clone()));
                }
            }
        }

        if let Some(payment) = &write.payment {
            if let Some(existing) = state.payments.get(&payment.key) {
                return Ok(CommitOutcome::DuplicatePayment(existing.clone()));
            }
        }

        let mut staged = state.clone();
        if self.accept_any_user {
            staged.users.insert(write.user_id.clone());
        }

        let mut touched = Vec::new();
        for sub_write in write.subscriptions {
            touched.push(sub_write.subscription().correlation.clone());
            Self::stage_subscription(&mut staged, sub_write)?;
        }

        for correlation in &touched {
            if staged.live_rows_for(correlation).count() > 1 {
                return Err(DomainError::new(
                    ErrorCode::CorrelationKeyConflict,
                    format!("more than one live subscription for {}", correlation),
                ));
            }
        }

        if let Some(payment) = write.payment {
            if self.fail_next_payment_insert.swap(false, Ordering::SeqCst) {
                return Err(DomainError::database("injected payment insert failure"));
            }
            staged.payments.insert(payment.key.clone(), payment);
        }

        for event in write.events {
            if let Some(id) = &event.notification_id {
                staged.notification_ids.insert(id.clone());
            }
            staged.events.push(event);
        }

        let entitlement = Entitlement::project(&write.user_id, staged.subscriptions.values(), write.now);
        staged
            .entitlements
            .insert(write.user_id.clone(), entitlement.clone());

        *state = staged;
        Ok(CommitOutcome::Committed { entitlement })
    }
}

#[async_trait]
impl SubscriptionEventLog for InMemoryLedgerStore {
    async fn append(&self, event: SubscriptionEvent) -> Result<AppendResult, DomainError> {
        let mut state = self.state.write().await;
        if let Some(id) = &event.notification_id {
            if !state.notification_ids.insert(id.clone()) {
                return Ok(AppendResult::DuplicateNotification);
            }
        }
        state.events.push(event);
        Ok(AppendResult::Appended)
    }

    async fn find_by_notification_id(
        &self,
        notification_id: &str,
    ) -> Result<Option<SubscriptionEvent>, DomainError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .find(|e| e.notification_id.as_deref() == Some(notification_id))
            .cloned())
    }

    async fn list_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<SubscriptionEvent>, DomainError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.subscription_id.as_ref() == Some(subscription_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::{
        EventOutcome, EventSource, NewSubscription, PaymentKey, Store, TransactionType,
    };
    use crate::domain::foundation::{Money, ProductId, Timestamp};
    use serde_json::json;

    fn user() -> UserId {
        UserId::new("user-1").unwrap()
    }

    fn subscription(key: &str, now: Timestamp) -> Subscription {
        Subscription::open(
            NewSubscription {
                user_id: user(),
                product_id: ProductId::new("premium_monthly").unwrap(),
                store_product_id: Some("premium_monthly".into()),
                correlation: StoreRef::for_store(Store::Mobile, key).unwrap(),
                price: Money::new(499, "EUR").unwrap(),
                period_end: now.plus_days(30),
                is_trial: false,
                auto_renewing: true,
                event_time: now,
                supersedes: None,
            },
            now,
        )
    }

    fn charge(sub: &Subscription, txn: &str, now: Timestamp) -> PaymentRecord {
        PaymentRecord::completed(
            sub.user_id.clone(),
            sub.id,
            PaymentKey::new(Store::Mobile, txn),
            TransactionType::Charge,
            Money::new(499, "EUR").unwrap(),
            now,
            now,
        )
    }

    async fn store() -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        store.register_user(user()).await;
        store
    }

    #[tokio::test]
    async fn commit_writes_everything_and_projects_entitlement() {
        let store = store().await;
        let now = Timestamp::now();
        let sub = subscription("tok-1", now);

        let outcome = store
            .commit(
                LedgerWrite::new(user(), now)
                    .insert(sub.clone())
                    .with_payment(Some(charge(&sub, "GPA.1", now))),
            )
            .await
            .unwrap();

        match outcome {
            CommitOutcome::Committed { entitlement } => {
                assert!(entitlement.is_entitled);
                assert_eq!(entitlement.subscription_id, Some(sub.id));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let stored = store.find_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(store.payment_count().await, 1);
        assert!(store.get_entitlement(&user()).await.unwrap().unwrap().is_entitled);
    }

    #[tokio::test]
    async fn duplicate_payment_key_writes_nothing() {
        let store = store().await;
        let now = Timestamp::now();
        let sub = subscription("tok-1", now);
        store
            .commit(LedgerWrite::new(user(), now).insert(sub.clone()).with_payment(Some(charge(&sub, "GPA.1", now))))
            .await
            .unwrap();

        let stored = store.find_subscription(&sub.id).await.unwrap().unwrap();
        let outcome = store
            .commit(LedgerWrite::new(user(), now).update(stored).with_payment(Some(charge(&sub, "GPA.1", now))))
            .await
            .unwrap();

        assert!(matches!(outcome, CommitOutcome::DuplicatePayment(_)));
        assert_eq!(store.find_subscription(&sub.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = store().await;
        let now = Timestamp::now();
        let sub = subscription("tok-1", now);
        store.commit(LedgerWrite::new(user(), now).insert(sub.clone())).await.unwrap();

        let stored = store.find_subscription(&sub.id).await.unwrap().unwrap();
        store.commit(LedgerWrite::new(user(), now).update(stored.clone())).await.unwrap();

        let err = store.commit(LedgerWrite::new(user(), now).update(stored)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConcurrentModification);
    }

    #[tokio::test]
    async fn second_live_row_for_a_key_is_rejected() {
        let store = store().await;
        let now = Timestamp::now();
        store.commit(LedgerWrite::new(user(), now).insert(subscription("tok-1", now))).await.unwrap();

        let err = store
            .commit(LedgerWrite::new(user(), now).insert(subscription("tok-1", now)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CorrelationKeyConflict);
        assert_eq!(store.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn injected_payment_failure_rolls_back_the_unit() {
        let store = store().await;
        let now = Timestamp::now();
        let sub = subscription("tok-1", now);
        store.fail_next_payment_insert();

        let result = store
            .commit(LedgerWrite::new(user(), now).insert(sub.clone()).with_payment(Some(charge(&sub, "GPA.1", now))))
            .await;

        assert!(result.is_err());
        assert_eq!(store.subscription_count().await, 0);
        assert_eq!(store.payment_count().await, 0);
        assert!(store.get_entitlement(&user()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let now = Timestamp::now();
        let err = store
            .commit(LedgerWrite::new(user(), now).insert(subscription("tok-1", now)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UserNotFound);
    }

    #[tokio::test]
    async fn notification_ids_are_unique_in_the_log() {
        let store = store().await;
        let now = Timestamp::now();
        let mut entry = SubscriptionEvent::system("unsupported", EventSource::Webhook, json!({}), now);
        entry.notification_id = Some("n-1".into());
        entry.outcome = EventOutcome::NoChange;

        assert_eq!(store.append(entry.clone()).await.unwrap(), AppendResult::Appended);
        assert_eq!(store.append(entry).await.unwrap(), AppendResult::DuplicateNotification);
        assert!(store.find_by_notification_id("n-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_by_status_pages_by_id() {
        let store = store().await;
        let now = Timestamp::now();
        for i in 0..5 {
            store
                .commit(LedgerWrite::new(user(), now).insert(subscription(&format!("tok-{}", i), now)))
                .await
                .unwrap();
        }

        let first = store.list_by_status(&[SubscriptionStatus::Active], None, 3).await.unwrap();
        let rest = store
            .list_by_status(&[SubscriptionStatus::Active], first.last().map(|s| s.id), 3)
            .await
            .unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(rest.len(), 2);
        assert!(first.iter().all(|a| rest.iter().all(|b| a.id < b.id)));
    }
}
