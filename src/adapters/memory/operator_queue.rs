//! In-memory operator queue.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::domain::foundation::DomainError;
use crate::ports::{OperatorAlert, OperatorQueue};

#[derive(Debug, Default)]
pub struct InMemoryOperatorQueue {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl InMemoryOperatorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OperatorQueue for InMemoryOperatorQueue {
    async fn push(&self, alert: OperatorAlert) -> Result<(), DomainError> {
        self.alerts
            .lock()
            .map_err(|_| DomainError::database("operator queue lock poisoned"))?
            .push(alert);
        Ok(())
    }

    async fn list_open(&self, limit: usize) -> Result<Vec<OperatorAlert>, DomainError> {
        let alerts = self
            .alerts
            .lock()
            .map_err(|_| DomainError::database("operator queue lock poisoned"))?;
        Ok(alerts.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::billing::{BillingError, Store};
    use crate::domain::foundation::Timestamp;

    #[tokio::test]
    async fn keeps_alerts_in_arrival_order() {
        let queue = InMemoryOperatorQueue::new();
        for key in ["a", "b", "c"] {
            let alert = OperatorAlert::from_error(
                Store::Web,
                "renewed",
                &BillingError::SubscriptionNotFound(key.into()),
                Timestamp::now(),
            )
            .with_correlation_key(key);
            queue.push(alert).await.unwrap();
        }

        let open = queue.list_open(2).await.unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].correlation_key.as_deref(), Some("a"));
    }
}
