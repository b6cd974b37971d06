//! Append-only subscription event log port.
//!
//! Entries that accompany a ledger change are written inside
//! [`LedgerStore::commit`](super::LedgerStore::commit). This port covers the
//! entries that stand alone (unsupported notifications, rejected events,
//! worker tallies) and the read side used for webhook deduplication.

use async_trait::async_trait;

use crate::domain::billing::SubscriptionEvent;
use crate::domain::foundation::{DomainError, SubscriptionId};

/// Result of appending a standalone entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Appended,
    /// The entry's notification id is already logged; nothing was written.
    DuplicateNotification,
}

#[async_trait]
pub trait SubscriptionEventLog: Send + Sync {
    /// Append an entry. Entries are never updated or deleted.
    async fn append(&self, event: SubscriptionEvent) -> Result<AppendResult, DomainError>;

    /// Find the entry that claimed a store notification id.
    async fn find_by_notification_id(
        &self,
        notification_id: &str,
    ) -> Result<Option<SubscriptionEvent>, DomainError>;

    /// Entries for one subscription, oldest first.
    async fn list_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<SubscriptionEvent>, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_is_object_safe() {
        fn _accepts_dyn(_log: &dyn SubscriptionEventLog) {}
    }
}
