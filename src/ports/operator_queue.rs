//! Operator queue port.
//!
//! Notifications that verified correctly but reference something this system
//! does not know (an unknown correlation key, product or user) cannot be
//! fixed by retrying. They are parked here for a human.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::billing::{BillingError, Store};
use crate::domain::foundation::{DomainError, OperatorAlertId, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub id: OperatorAlertId,
    pub store: Store,
    /// Event kind or notification type that could not be routed.
    pub kind: String,
    pub correlation_key: Option<String>,
    pub notification_id: Option<String>,
    pub error_code: String,
    pub message: String,
    pub payload: Value,
    pub created_at: Timestamp,
}

impl OperatorAlert {
    pub fn from_error(store: Store, kind: impl Into<String>, error: &BillingError, now: Timestamp) -> Self {
        Self {
            id: OperatorAlertId::new(),
            store,
            kind: kind.into(),
            correlation_key: None,
            notification_id: None,
            error_code: error.code().to_string(),
            message: error.to_string(),
            payload: Value::Null,
            created_at: now,
        }
    }

    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    pub fn with_notification_id(mut self, id: Option<String>) -> Self {
        self.notification_id = id;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[async_trait]
pub trait OperatorQueue: Send + Sync {
    async fn push(&self, alert: OperatorAlert) -> Result<(), DomainError>;

    /// Oldest alerts first.
    async fn list_open(&self, limit: usize) -> Result<Vec<OperatorAlert>, DomainError>;
}
