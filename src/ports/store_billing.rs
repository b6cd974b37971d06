//! Store billing API port.
//!
//! Each billing platform exposes a server API that answers "what is the
//! authoritative state of this subscription" and accepts cancel and refund
//! requests. Reconciliation, orphan recovery and user/operator commands go
//! through this port; webhooks never do.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::billing::{BillingError, Store, StoreRef};
use crate::domain::foundation::{Money, Timestamp, UserId};

/// Lifecycle as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLifecycle {
    Active,
    InGracePeriod,
    /// Retry window without entitlement (mobile "account hold").
    OnHold,
    Paused,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePaymentState {
    Received,
    FreeTrial,
    Pending,
}

/// Authoritative subscription state fetched from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSubscriptionState {
    pub lifecycle: StoreLifecycle,
    pub expires_at: Timestamp,
    pub auto_renewing: bool,
    pub payment_state: StorePaymentState,
    pub grace_period_end: Option<Timestamp>,
    /// Latest charge, when the store reports one.
    pub latest_transaction_id: Option<String>,
    pub amount: Option<Money>,
    /// Account reference attached at purchase time.
    pub account_ref: Option<UserId>,
    pub store_product_id: Option<String>,
}

impl StoreSubscriptionState {
    pub fn is_trial(&self) -> bool {
        self.payment_state == StorePaymentState::FreeTrial
    }
}

/// Store API errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0}ms")]
    Timeout(u64),

    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("store has no record of {0}")]
    NotFound(String),

    #[error("store response could not be decoded: {0}")]
    InvalidResponse(String),

    #[error("operation not offered by store: {0}")]
    Unsupported(String),
}

impl StoreError {
    /// Network failures, timeouts, throttling and 5xx answers.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => true,
            StoreError::Rejected { status, .. } => *status == 429 || *status >= 500,
            StoreError::NotFound(_) | StoreError::InvalidResponse(_) | StoreError::Unsupported(_) => false,
        }
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            BillingError::StoreUnavailable(err.to_string())
        } else if let StoreError::NotFound(key) = err {
            BillingError::SubscriptionNotFound(key)
        } else {
            BillingError::StoreRejected(err.to_string())
        }
    }
}

#[async_trait]
pub trait StoreBillingClient: Send + Sync {
    fn store(&self) -> Store;

    /// Fetch the authoritative state of one subscription.
    ///
    /// `store_product_id` is required by stores that scope lookups by product.
    async fn validate_subscription(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
    ) -> Result<StoreSubscriptionState, StoreError>;

    /// Stop renewal, or end access now when `immediate`.
    async fn cancel(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
        immediate: bool,
    ) -> Result<(), StoreError>;

    /// Refund one charge.
    async fn refund(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
        transaction_id: &str,
    ) -> Result<(), StoreError>;
}

/// Store clients by store, built once at startup.
#[derive(Clone, Default)]
pub struct StoreClients {
    clients: HashMap<Store, Arc<dyn StoreBillingClient>>,
}

impl StoreClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, client: Arc<dyn StoreBillingClient>) -> Self {
        self.clients.insert(client.store(), client);
        self
    }

    pub fn for_store(&self, store: Store) -> Option<Arc<dyn StoreBillingClient>> {
        self.clients.get(&store).cloned()
    }

    /// Client for `store`, or `StoreUnavailable` when none is configured.
    pub fn require(&self, store: Store) -> Result<Arc<dyn StoreBillingClient>, BillingError> {
        self.for_store(store)
            .ok_or_else(|| BillingError::StoreUnavailable(format!("no client configured for {}", store)))
    }
}

impl std::fmt::Debug for StoreClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stores: Vec<_> = self.clients.keys().map(|s| s.as_str()).collect();
        stores.sort_unstable();
        f.debug_struct("StoreClients").field("stores", &stores).finish()
    }
}
