//! PostgreSQL implementation of LedgerStore.
//!
//! Each [`LedgerWrite`] runs in one transaction: the owner's `users` row is
//! locked first, so units of the same user queue behind each other while the
//! projection is recomputed. Unique violations on the payment key or the
//! notification id roll the unit back and surface as duplicate outcomes.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::timeout;

use crate::domain::billing::{
    Entitlement, PaymentKey, PaymentRecord, StoreRef, Subscription, SubscriptionStatus,
};
use crate::domain::foundation::{DomainError, ErrorCode, SubscriptionId, UserId};
use crate::ports::{CommitOutcome, LedgerStore, LedgerWrite, SubscriptionWrite};

use super::rows::{
    db_error, insert_event, unique_violation, EntitlementRow, PaymentRow, SubscriptionRow, Tx,
    LIVE_CORRELATION_INDEX, NOTIFICATION_ID_CONSTRAINT, PAYMENT_COLUMNS, PAYMENT_KEY_CONSTRAINT,
    SUBSCRIPTION_COLUMNS,
};

/// Why a staged unit stopped before commit.
enum Abort {
    Duplicate(CommitOutcome),
    Failed(DomainError),
}

impl From<DomainError> for Abort {
    fn from(err: DomainError) -> Self {
        Abort::Failed(err)
    }
}

pub struct PostgresLedgerStore {
    pool: PgPool,
    commit_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            commit_timeout: Duration::from_secs(10),
        }
    }

    /// Bounds one unit from `BEGIN` to `COMMIT`.
    pub fn with_commit_timeout(mut self, commit_timeout: Duration) -> Self {
        self.commit_timeout = commit_timeout;
        self
    }

    async fn run_unit(&self, write: LedgerWrite) -> Result<CommitOutcome, DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error("Failed to begin ledger unit"))?;

        match stage(&mut tx, write).await {
            Ok(entitlement) => {
                tx.commit().await.map_err(db_error("Failed to commit ledger unit"))?;
                Ok(CommitOutcome::Committed { entitlement })
            }
            Err(abort) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(error = %e, "Rollback of ledger unit failed");
                }
                match abort {
                    Abort::Duplicate(CommitOutcome::DuplicatePayment(attempted)) => {
                        // lost the insert race; report the row that won
                        let existing = self.find_payment(&attempted.key).await?.unwrap_or(attempted);
                        Ok(CommitOutcome::DuplicatePayment(existing))
                    }
                    Abort::Duplicate(outcome) => Ok(outcome),
                    Abort::Failed(err) => Err(err),
                }
            }
        }
    }
}

async fn stage(tx: &mut Tx<'_>, write: LedgerWrite) -> Result<Entitlement, Abort> {
    // 1. Lock the owner
    let owner: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(write.user_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("Failed to lock user"))?;
    if owner.is_none() {
        return Err(Abort::Failed(DomainError::new(
            ErrorCode::UserNotFound,
            format!("user {} not found", write.user_id),
        )));
    }

    // 2. Claimed notification ids and booked payments
    for event in &write.events {
        if let Some(id) = &event.notification_id {
            let seen: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM subscription_events WHERE notification_id = $1)",
            )
            .bind(id)
            .fetch_one(&mut **tx)
            .await
            .map_err(db_error("Failed to check notification id"))?;
            if seen {
                return Err(Abort::Duplicate(CommitOutcome::DuplicateNotification(id.clone())));
            }
        }
    }
    if let Some(payment) = &write.payment {
        if let Some(existing) = fetch_payment(&mut **tx, &payment.key).await? {
            return Err(Abort::Duplicate(CommitOutcome::DuplicatePayment(existing)));
        }
    }

    // 3. Subscription rows; updates first so a superseded row leaves the live index
    let (updates, inserts): (Vec<_>, Vec<_>) = write
        .subscriptions
        .into_iter()
        .partition(|w| matches!(w, SubscriptionWrite::Update { .. }));
    for sub_write in updates.into_iter().chain(inserts) {
        write_subscription(tx, sub_write).await?;
    }

    // 4. Payment record
    if let Some(payment) = write.payment {
        if let Err(e) = insert_payment(tx, &payment).await {
            if unique_violation(&e) == Some(PAYMENT_KEY_CONSTRAINT) {
                return Err(Abort::Duplicate(CommitOutcome::DuplicatePayment(payment)));
            }
            return Err(Abort::Failed(db_error("Failed to insert payment record")(e)));
        }
    }

    // 5. Event log entries
    for event in &write.events {
        if let Err(e) = insert_event(tx, event).await {
            if unique_violation(&e) == Some(NOTIFICATION_ID_CONSTRAINT) {
                let id = event.notification_id.clone().unwrap_or_default();
                return Err(Abort::Duplicate(CommitOutcome::DuplicateNotification(id)));
            }
            return Err(Abort::Failed(db_error("Failed to append subscription event")(e)));
        }
    }

    // 6. Entitlement projection
    let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
        "SELECT {} FROM subscriptions WHERE user_id = $1",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(write.user_id.as_str())
    .fetch_all(&mut **tx)
    .await
    .map_err(db_error("Failed to load subscriptions for projection"))?;
    let subscriptions = rows
        .into_iter()
        .map(Subscription::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let entitlement = Entitlement::project(&write.user_id, &subscriptions, write.now);

    sqlx::query(
        r#"
        UPDATE users SET
            is_entitled = $2,
            entitlement_expires_at = $3,
            entitlement_subscription_id = $4,
            entitlement_computed_at = $5
        WHERE id = $1
        "#,
    )
    .bind(write.user_id.as_str())
    .bind(entitlement.is_entitled)
    .bind(entitlement.expires_at.map(|t| *t.as_datetime()))
    .bind(entitlement.subscription_id.map(|id| *id.as_uuid()))
    .bind(entitlement.computed_at.as_datetime())
    .execute(&mut **tx)
    .await
    .map_err(db_error("Failed to write entitlement projection"))?;

    Ok(entitlement)
}

async fn write_subscription(tx: &mut Tx<'_>, write: SubscriptionWrite) -> Result<(), DomainError> {
    match write {
        SubscriptionWrite::Insert(sub) => {
            let result = sqlx::query(
                r#"
                INSERT INTO subscriptions (
                    id, user_id, store, product_id, store_product_id, correlation_key, start_date,
                    current_period_end, trial_end_date, grace_period_end, status, auto_renewing,
                    price_amount_minor, price_currency, validation_attempts, last_validated_at,
                    supersedes, superseded_by, version, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                          $17, $18, 1, $19, $20)
                "#,
            )
            .bind(sub.id.as_uuid())
            .bind(sub.user_id.as_str())
            .bind(sub.store.as_str())
            .bind(sub.product_id.as_str())
            .bind(&sub.store_product_id)
            .bind(sub.correlation.key())
            .bind(sub.start_date.as_datetime())
            .bind(sub.current_period_end.as_datetime())
            .bind(sub.trial_end_date.map(|t| *t.as_datetime()))
            .bind(sub.grace_period_end.map(|t| *t.as_datetime()))
            .bind(sub.status().as_str())
            .bind(sub.auto_renewing)
            .bind(sub.price.amount_minor)
            .bind(&sub.price.currency)
            .bind(i32::try_from(sub.validation_attempts).unwrap_or(i32::MAX))
            .bind(sub.last_validated_at.map(|t| *t.as_datetime()))
            .bind(sub.supersedes.map(|id| *id.as_uuid()))
            .bind(sub.superseded_by.map(|id| *id.as_uuid()))
            .bind(sub.created_at.as_datetime())
            .bind(sub.updated_at.as_datetime())
            .execute(&mut **tx)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(e) if unique_violation(&e) == Some(LIVE_CORRELATION_INDEX) => Err(DomainError::new(
                    ErrorCode::CorrelationKeyConflict,
                    format!("more than one live subscription for {}", sub.correlation),
                )),
                Err(e) if unique_violation(&e).is_some() => Err(DomainError::new(
                    ErrorCode::ConcurrentModification,
                    format!("subscription {} already exists", sub.id),
                )),
                Err(e) => Err(db_error("Failed to insert subscription")(e)),
            }
        }
        SubscriptionWrite::Update {
            subscription: sub,
            expected_version,
        } => {
            let result = sqlx::query(
                r#"
                UPDATE subscriptions SET
                    product_id = $3,
                    store_product_id = $4,
                    current_period_end = $5,
                    trial_end_date = $6,
                    grace_period_end = $7,
                    status = $8,
                    auto_renewing = $9,
                    price_amount_minor = $10,
                    price_currency = $11,
                    validation_attempts = $12,
                    last_validated_at = $13,
                    superseded_by = $14,
                    updated_at = $15,
                    version = version + 1
                WHERE id = $1 AND version = $2
                "#,
            )
            .bind(sub.id.as_uuid())
            .bind(expected_version)
            .bind(sub.product_id.as_str())
            .bind(&sub.store_product_id)
            .bind(sub.current_period_end.as_datetime())
            .bind(sub.trial_end_date.map(|t| *t.as_datetime()))
            .bind(sub.grace_period_end.map(|t| *t.as_datetime()))
            .bind(sub.status().as_str())
            .bind(sub.auto_renewing)
            .bind(sub.price.amount_minor)
            .bind(&sub.price.currency)
            .bind(i32::try_from(sub.validation_attempts).unwrap_or(i32::MAX))
            .bind(sub.last_validated_at.map(|t| *t.as_datetime()))
            .bind(sub.superseded_by.map(|id| *id.as_uuid()))
            .bind(sub.updated_at.as_datetime())
            .execute(&mut **tx)
            .await
            .map_err(db_error("Failed to update subscription"))?;

            if result.rows_affected() == 0 {
                return Err(DomainError::new(
                    ErrorCode::ConcurrentModification,
                    format!(
                        "subscription {} changed since version {}",
                        sub.id, expected_version
                    ),
                ));
            }
            Ok(())
        }
    }
}

async fn insert_payment(tx: &mut Tx<'_>, payment: &PaymentRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_records (
            id, user_id, subscription_id, store, store_transaction_id, transaction_type,
            amount_minor, currency, status, transaction_date, exported, reconciled, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(payment.id.as_uuid())
    .bind(payment.user_id.as_str())
    .bind(payment.subscription_id.as_uuid())
    .bind(payment.key.store.as_str())
    .bind(&payment.key.store_transaction_id)
    .bind(payment.transaction_type.as_str())
    .bind(payment.amount.amount_minor)
    .bind(&payment.amount.currency)
    .bind(payment.status.as_str())
    .bind(payment.transaction_date.as_datetime())
    .bind(payment.exported)
    .bind(payment.reconciled)
    .bind(payment.created_at.as_datetime())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn fetch_payment<'e, E>(executor: E, key: &PaymentKey) -> Result<Option<PaymentRecord>, DomainError>
where
    E: sqlx::PgExecutor<'e>,
{
    let row: Option<PaymentRow> = sqlx::query_as(&format!(
        "SELECT {} FROM payment_records WHERE store = $1 AND store_transaction_id = $2",
        PAYMENT_COLUMNS
    ))
    .bind(key.store.as_str())
    .bind(&key.store_transaction_id)
    .fetch_optional(executor)
    .await
    .map_err(db_error("Failed to find payment record"))?;

    row.map(PaymentRecord::try_from).transpose()
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn find_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, DomainError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find subscription"))?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_live_by_correlation(&self, correlation: &StoreRef) -> Result<Option<Subscription>, DomainError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions \
             WHERE store = $1 AND correlation_key = $2 AND superseded_by IS NULL",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(correlation.store().as_str())
        .bind(correlation.key())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find subscription by correlation key"))?;

        row.map(Subscription::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Subscription>, DomainError> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list subscriptions"))?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn list_by_status(
        &self,
        statuses: &[SubscriptionStatus],
        after: Option<SubscriptionId>,
        limit: usize,
    ) -> Result<Vec<Subscription>, DomainError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions \
             WHERE superseded_by IS NULL AND status = ANY($1) AND ($2::uuid IS NULL OR id > $2) \
             ORDER BY id LIMIT $3",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(statuses)
        .bind(after.map(|id| *id.as_uuid()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to page subscriptions"))?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn find_payment(&self, key: &PaymentKey) -> Result<Option<PaymentRecord>, DomainError> {
        fetch_payment(&self.pool, key).await
    }

    async fn list_payments(&self, subscription_id: &SubscriptionId) -> Result<Vec<PaymentRecord>, DomainError> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_records WHERE subscription_id = $1 ORDER BY created_at",
            PAYMENT_COLUMNS
        ))
        .bind(subscription_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list payment records"))?;

        rows.into_iter().map(PaymentRecord::try_from).collect()
    }

    async fn get_entitlement(&self, user_id: &UserId) -> Result<Option<Entitlement>, DomainError> {
        let row: Option<EntitlementRow> = sqlx::query_as(
            r#"
            SELECT id, is_entitled, entitlement_expires_at, entitlement_subscription_id,
                   entitlement_computed_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to read entitlement"))?;

        match row {
            Some(row) => row.into_entitlement(),
            None => Ok(None),
        }
    }

    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, DomainError> {
        let user_id = write.user_id.clone();
        match timeout(self.commit_timeout, self.run_unit(write)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    timeout_ms = self.commit_timeout.as_millis() as u64,
                    "Ledger unit timed out; rolled back"
                );
                Err(DomainError::database("ledger unit timed out"))
            }
        }
    }
}
