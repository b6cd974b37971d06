//! PostgreSQL implementation of SubscriptionEventLog.
//!
//! Standalone entries only; entries that accompany a ledger change are
//! written by `PostgresLedgerStore::commit` in the same transaction.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::domain::billing::SubscriptionEvent;
use crate::domain::foundation::{DomainError, SubscriptionId};
use crate::ports::{AppendResult, SubscriptionEventLog};

use super::rows::{db_error, insert_event, unique_violation, EventRow, EVENT_COLUMNS, NOTIFICATION_ID_CONSTRAINT};

pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionEventLog for PostgresEventLog {
    async fn append(&self, event: SubscriptionEvent) -> Result<AppendResult, DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error("Failed to begin append"))?;

        match insert_event(&mut tx, &event).await {
            Ok(()) => {
                tx.commit().await.map_err(db_error("Failed to commit append"))?;
                Ok(AppendResult::Appended)
            }
            Err(e) if unique_violation(&e) == Some(NOTIFICATION_ID_CONSTRAINT) => {
                tracing::debug!(
                    notification_id = ?event.notification_id,
                    kind = %event.kind,
                    "Notification id already logged"
                );
                Ok(AppendResult::DuplicateNotification)
            }
            Err(e) => Err(db_error("Failed to append subscription event")(e)),
        }
    }

    async fn find_by_notification_id(
        &self,
        notification_id: &str,
    ) -> Result<Option<SubscriptionEvent>, DomainError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_events WHERE notification_id = $1",
            EVENT_COLUMNS
        ))
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find event by notification id"))?;

        row.map(SubscriptionEvent::try_from).transpose()
    }

    async fn list_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<SubscriptionEvent>, DomainError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscription_events WHERE subscription_id = $1 ORDER BY recorded_at, id",
            EVENT_COLUMNS
        ))
        .bind(subscription_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list subscription events"))?;

        rows.into_iter().map(SubscriptionEvent::try_from).collect()
    }
}
