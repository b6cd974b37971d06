//! Scripted store client for tests and local runs.
//!
//! Supports:
//! - Pre-configured subscription states by correlation key
//! - Error injection, once or persistently
//! - Call tracking

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::domain::billing::{Store, StoreRef};
use crate::ports::{StoreBillingClient, StoreError, StoreSubscriptionState};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Validate(String),
    Cancel { key: String, immediate: bool },
    Refund { key: String, transaction_id: String },
}

#[derive(Default)]
struct ScriptState {
    states: HashMap<String, StoreSubscriptionState>,
    queued_errors: HashMap<String, VecDeque<StoreError>>,
    persistent_errors: HashMap<String, StoreError>,
    calls: Vec<StoreCall>,
}

#[derive(Clone)]
pub struct ScriptedStoreClient {
    store: Store,
    inner: Arc<Mutex<ScriptState>>,
}

impl ScriptedStoreClient {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            inner: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// State returned for `key` until replaced.
    pub fn set_state(&self, key: &str, state: StoreSubscriptionState) {
        self.with_state(|s| {
            s.states.insert(key.to_string(), state);
        });
    }

    /// Fails the next call for `key` with `error`.
    pub fn fail_once(&self, key: &str, error: StoreError) {
        self.with_state(|s| s.queued_errors.entry(key.to_string()).or_default().push_back(error));
    }

    /// Fails every call for `key` with `error` until cleared.
    pub fn fail_always(&self, key: &str, error: StoreError) {
        self.with_state(|s| {
            s.persistent_errors.insert(key.to_string(), error);
        });
    }

    pub fn clear_failures(&self, key: &str) {
        self.with_state(|s| {
            s.queued_errors.remove(key);
            s.persistent_errors.remove(key);
        });
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.with_state(|s| s.calls.clone())
    }

    fn record(&self, call: StoreCall, key: &str) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.calls.push(call);
            if let Some(err) = s.queued_errors.get_mut(key).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            match s.persistent_errors.get(key) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        })
    }
}

#[async_trait]
impl StoreBillingClient for ScriptedStoreClient {
    fn store(&self) -> Store {
        self.store
    }

    async fn validate_subscription(
        &self,
        _store_product_id: Option<&str>,
        correlation: &StoreRef,
    ) -> Result<StoreSubscriptionState, StoreError> {
        let key = correlation.key();
        self.record(StoreCall::Validate(key.to_string()), key)?;
        self.with_state(|s| s.states.get(key).cloned())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn cancel(
        &self,
        _store_product_id: Option<&str>,
        correlation: &StoreRef,
        immediate: bool,
    ) -> Result<(), StoreError> {
        let key = correlation.key();
        self.record(
            StoreCall::Cancel {
                key: key.to_string(),
                immediate,
            },
            key,
        )
    }

    async fn refund(
        &self,
        _store_product_id: Option<&str>,
        correlation: &StoreRef,
        transaction_id: &str,
    ) -> Result<(), StoreError> {
        let key = correlation.key();
        self.record(
            StoreCall::Refund {
                key: key.to_string(),
                transaction_id: transaction_id.to_string(),
            },
            key,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::Timestamp;
    use crate::ports::{StoreLifecycle, StorePaymentState};

    fn state() -> StoreSubscriptionState {
        StoreSubscriptionState {
            lifecycle: StoreLifecycle::Active,
            expires_at: Timestamp::now().plus_days(30),
            auto_renewing: true,
            payment_state: StorePaymentState::Received,
            grace_period_end: None,
            latest_transaction_id: None,
            amount: None,
            account_ref: None,
            store_product_id: None,
        }
    }

    #[tokio::test]
    async fn returns_scripted_state_and_records_calls() {
        let client = ScriptedStoreClient::new(Store::Mobile);
        let key = StoreRef::for_store(Store::Mobile, "tok-1").unwrap();
        client.set_state("tok-1", state());

        assert!(client.validate_subscription(None, &key).await.is_ok());
        assert_eq!(client.calls(), vec![StoreCall::Validate("tok-1".into())]);
    }

    #[tokio::test]
    async fn queued_failures_are_consumed_once() {
        let client = ScriptedStoreClient::new(Store::Mobile);
        let key = StoreRef::for_store(Store::Mobile, "tok-1").unwrap();
        client.set_state("tok-1", state());
        client.fail_once("tok-1", StoreError::Unavailable("down".into()));

        assert!(client.validate_subscription(None, &key).await.is_err());
        assert!(client.validate_subscription(None, &key).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let client = ScriptedStoreClient::new(Store::AppStore);
        let key = StoreRef::for_store(Store::AppStore, "1").unwrap();
        assert!(matches!(
            client.validate_subscription(None, &key).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
