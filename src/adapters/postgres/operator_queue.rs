//! PostgreSQL implementation of OperatorQueue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::foundation::{DomainError, ErrorCode, OperatorAlertId, Timestamp};
use crate::ports::{OperatorAlert, OperatorQueue};

use super::rows::db_error;

pub struct PostgresOperatorQueue {
    pool: PgPool,
}

impl PostgresOperatorQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    store: String,
    kind: String,
    correlation_key: Option<String>,
    notification_id: Option<String>,
    error_code: String,
    message: String,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for OperatorAlert {
    type Error = DomainError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(OperatorAlert {
            id: OperatorAlertId::from_uuid(row.id),
            store: row.store.parse().map_err(|e| {
                DomainError::new(ErrorCode::DatabaseError, format!("Invalid store value: {}", e))
            })?,
            kind: row.kind,
            correlation_key: row.correlation_key,
            notification_id: row.notification_id,
            error_code: row.error_code,
            message: row.message,
            payload: row.payload,
            created_at: Timestamp::from_datetime(row.created_at),
        })
    }
}

#[async_trait]
impl OperatorQueue for PostgresOperatorQueue {
    async fn push(&self, alert: OperatorAlert) -> Result<(), DomainError> {
        sqlx::query(
            r#"
            INSERT INTO billing_operator_queue (
                id, store, kind, correlation_key, notification_id, error_code, message, payload, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(alert.id.as_uuid())
        .bind(alert.store.as_str())
        .bind(&alert.kind)
        .bind(&alert.correlation_key)
        .bind(&alert.notification_id)
        .bind(&alert.error_code)
        .bind(&alert.message)
        .bind(&alert.payload)
        .bind(alert.created_at.as_datetime())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to push operator alert"))?;

        Ok(())
    }

    async fn list_open(&self, limit: usize) -> Result<Vec<OperatorAlert>, DomainError> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, store, kind, correlation_key, notification_id, error_code, message, payload, created_at
            FROM billing_operator_queue
            WHERE resolved_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list operator alerts"))?;

        rows.into_iter().map(OperatorAlert::try_from).collect()
    }
}
