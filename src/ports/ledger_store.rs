//! Subscription ledger persistence port.
//!
//! The ledger is written exclusively through [`LedgerStore::commit`]: one
//! call is one indivisible unit covering subscription rows, at most one
//! payment record, the recomputed entitlement projection and the event log
//! entries describing the change. Either all of it becomes visible or none
//! of it does.
//!
//! # Concurrency
//!
//! - updates carry the version they were read at; a mismatch aborts the unit
//! - `(store, store_transaction_id)` is unique across payment records
//! - one live row per correlation key
//! - notification ids are unique in the event log

use async_trait::async_trait;

use crate::domain::billing::{
    Entitlement, PaymentKey, PaymentRecord, StoreRef, Subscription, SubscriptionEvent,
    SubscriptionStatus,
};
use crate::domain::foundation::{DomainError, SubscriptionId, Timestamp, UserId};

/// One subscription row change inside a unit.
#[derive(Debug, Clone)]
pub enum SubscriptionWrite {
    Insert(Subscription),
    /// Update guarded by the version the row was read at.
    Update {
        subscription: Subscription,
        expected_version: i64,
    },
}

impl SubscriptionWrite {
    /// Update of a row previously read from the store.
    pub fn update(subscription: Subscription) -> Self {
        let expected_version = subscription.version;
        SubscriptionWrite::Update {
            subscription,
            expected_version,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        match self {
            SubscriptionWrite::Insert(s) => s,
            SubscriptionWrite::Update { subscription, .. } => subscription,
        }
    }
}

/// Everything one atomic unit writes.
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    /// Owner whose entitlement projection is recomputed.
    pub user_id: UserId,
    pub subscriptions: Vec<SubscriptionWrite>,
    pub payment: Option<PaymentRecord>,
    pub events: Vec<SubscriptionEvent>,
    pub now: Timestamp,
}

impl LedgerWrite {
    pub fn new(user_id: UserId, now: Timestamp) -> Self {
        Self {
            user_id,
            subscriptions: Vec::new(),
            payment: None,
            events: Vec::new(),
            now,
        }
    }

    pub fn insert(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(SubscriptionWrite::Insert(subscription));
        self
    }

    pub fn update(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(SubscriptionWrite::update(subscription));
        self
    }

    pub fn with_payment(mut self, payment: Option<PaymentRecord>) -> Self {
        self.payment = payment;
        self
    }

    pub fn event(mut self, event: SubscriptionEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Result of a unit that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Everything was written; carries the recomputed projection.
    Committed { entitlement: Entitlement },
    /// The payment key already exists. Nothing was written.
    DuplicatePayment(PaymentRecord),
    /// A notification id in the unit is already logged. Nothing was written.
    DuplicateNotification(String),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, DomainError>;

    /// The row for `correlation` that has not been superseded.
    async fn find_live_by_correlation(&self, correlation: &StoreRef) -> Result<Option<Subscription>, DomainError>;

    /// All rows of a user, superseded ones included, newest first.
    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Subscription>, DomainError>;

    /// Live rows in any of `statuses`, ordered by id, starting after `after`.
    ///
    /// Keyset paging keeps batches stable while rows change underneath.
    async fn list_by_status(
        &self,
        statuses: &[SubscriptionStatus],
        after: Option<SubscriptionId>,
        limit: usize,
    ) -> Result<Vec<Subscription>, DomainError>;

    async fn find_payment(&self, key: &PaymentKey) -> Result<Option<PaymentRecord>, DomainError>;

    async fn list_payments(&self, subscription_id: &SubscriptionId) -> Result<Vec<PaymentRecord>, DomainError>;

    /// Last committed projection, if any unit has written one.
    async fn get_entitlement(&self, user_id: &UserId) -> Result<Option<Entitlement>, DomainError>;

    /// Writes one unit atomically.
    ///
    /// # Errors
    ///
    /// - `UserNotFound` if the owner does not exist
    /// - `ConcurrentModification` if an update's expected version is stale,
    ///   or a second live row would be created for a correlation key
    /// - `DatabaseError` on any storage failure (nothing is written)
    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, DomainError>;
}
