//! Row types and column lists shared by the PostgreSQL adapters.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::domain::billing::{
    Entitlement, EventOutcome, EventSource, PaymentKey, PaymentRecord, Store, StoreRef, Subscription,
    SubscriptionEvent, SubscriptionStatus,
};
use crate::domain::foundation::{
    DomainError, ErrorCode, Money, PaymentRecordId, ProductId, SubscriptionEventId, SubscriptionId,
    Timestamp, UserId,
};

pub(super) const SUBSCRIPTION_COLUMNS: &str = "id, user_id, store, product_id, store_product_id, \
    correlation_key, start_date, current_period_end, trial_end_date, grace_period_end, status, \
    auto_renewing, price_amount_minor, price_currency, validation_attempts, last_validated_at, \
    supersedes, superseded_by, version, created_at, updated_at";

pub(super) const PAYMENT_COLUMNS: &str = "id, user_id, subscription_id, store, store_transaction_id, \
    transaction_type, amount_minor, currency, status, transaction_date, exported, reconciled, created_at";

pub(super) const EVENT_COLUMNS: &str = "id, subscription_id, user_id, kind, source, outcome, \
    previous_status, new_status, notification_id, payload, occurred_at, recorded_at";

/// Unique index allowing one live row per correlation key.
pub(super) const LIVE_CORRELATION_INDEX: &str = "subscriptions_live_correlation_key";
pub(super) const PAYMENT_KEY_CONSTRAINT: &str = "payment_records_store_transaction_key";
pub(super) const NOTIFICATION_ID_CONSTRAINT: &str = "subscription_events_notification_id_key";

pub(super) type Tx<'a> = Transaction<'a, Postgres>;

pub(super) fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> DomainError {
    move |e| DomainError::database(format!("{}: {}", context, e))
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> DomainError {
    DomainError::new(ErrorCode::DatabaseError, format!("Invalid {} value: {}", column, detail))
}

/// Name of the constraint a unique violation tripped, if that is what `e` is.
pub(super) fn unique_violation(e: &sqlx::Error) -> Option<&str> {
    match e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => db_err.constraint(),
        _ => None,
    }
}

fn ts(dt: DateTime<Utc>) -> Timestamp {
    Timestamp::from_datetime(dt)
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct SubscriptionRow {
    id: Uuid,
    user_id: String,
    store: String,
    product_id: String,
    store_product_id: Option<String>,
    correlation_key: String,
    start_date: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    trial_end_date: Option<DateTime<Utc>>,
    grace_period_end: Option<DateTime<Utc>>,
    status: String,
    auto_renewing: bool,
    price_amount_minor: i64,
    price_currency: String,
    validation_attempts: i32,
    last_validated_at: Option<DateTime<Utc>>,
    supersedes: Option<Uuid>,
    superseded_by: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DomainError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let store: Store = row.store.parse().map_err(|e| corrupt("store", e))?;
        let status: SubscriptionStatus = row.status.parse().map_err(|e| corrupt("status", e))?;

        Ok(Subscription {
            id: SubscriptionId::from_uuid(row.id),
            user_id: UserId::new(row.user_id).map_err(|e| corrupt("user_id", e))?,
            store,
            product_id: ProductId::new(row.product_id).map_err(|e| corrupt("product_id", e))?,
            store_product_id: row.store_product_id,
            correlation: StoreRef::for_store(store, row.correlation_key)
                .map_err(|e| corrupt("correlation_key", e))?,
            start_date: ts(row.start_date),
            current_period_end: ts(row.current_period_end),
            trial_end_date: row.trial_end_date.map(ts),
            grace_period_end: row.grace_period_end.map(ts),
            status,
            auto_renewing: row.auto_renewing,
            price: Money::new(row.price_amount_minor, &row.price_currency)
                .map_err(|e| corrupt("price_currency", e))?,
            validation_attempts: u32::try_from(row.validation_attempts).unwrap_or(0),
            last_validated_at: row.last_validated_at.map(ts),
            supersedes: row.supersedes.map(SubscriptionId::from_uuid),
            superseded_by: row.superseded_by.map(SubscriptionId::from_uuid),
            version: row.version,
            created_at: ts(row.created_at),
            updated_at: ts(row.updated_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct PaymentRow {
    id: Uuid,
    user_id: String,
    subscription_id: Uuid,
    store: String,
    store_transaction_id: String,
    transaction_type: String,
    amount_minor: i64,
    currency: String,
    status: String,
    transaction_date: DateTime<Utc>,
    exported: bool,
    reconciled: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = DomainError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let store: Store = row.store.parse().map_err(|e| corrupt("store", e))?;
        Ok(PaymentRecord {
            id: PaymentRecordId::from_uuid(row.id),
            user_id: UserId::new(row.user_id).map_err(|e| corrupt("user_id", e))?,
            subscription_id: SubscriptionId::from_uuid(row.subscription_id),
            key: PaymentKey::new(store, row.store_transaction_id),
            transaction_type: row
                .transaction_type
                .parse()
                .map_err(|e| corrupt("transaction_type", e))?,
            amount: Money::new(row.amount_minor, &row.currency).map_err(|e| corrupt("currency", e))?,
            status: row.status.parse().map_err(|e| corrupt("payment status", e))?,
            transaction_date: ts(row.transaction_date),
            exported: row.exported,
            reconciled: row.reconciled,
            created_at: ts(row.created_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct EventRow {
    id: Uuid,
    subscription_id: Option<Uuid>,
    user_id: Option<String>,
    kind: String,
    source: String,
    outcome: String,
    previous_status: Option<String>,
    new_status: Option<String>,
    notification_id: Option<String>,
    payload: Value,
    occurred_at: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
}

fn parse_status(column: &str, value: Option<String>) -> Result<Option<SubscriptionStatus>, DomainError> {
    value
        .map(|s| s.parse::<SubscriptionStatus>().map_err(|e| corrupt(column, e)))
        .transpose()
}

impl TryFrom<EventRow> for SubscriptionEvent {
    type Error = DomainError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let source: EventSource = row.source.parse().map_err(|e| corrupt("source", e))?;
        let outcome: EventOutcome = row.outcome.parse().map_err(|e| corrupt("outcome", e))?;
        Ok(SubscriptionEvent {
            id: SubscriptionEventId::from_uuid(row.id),
            subscription_id: row.subscription_id.map(SubscriptionId::from_uuid),
            user_id: row
                .user_id
                .map(|id| UserId::new(id).map_err(|e| corrupt("user_id", e)))
                .transpose()?,
            kind: row.kind,
            source,
            outcome,
            previous_status: parse_status("previous_status", row.previous_status)?,
            new_status: parse_status("new_status", row.new_status)?,
            notification_id: row.notification_id,
            payload: row.payload,
            occurred_at: ts(row.occurred_at),
            recorded_at: ts(row.recorded_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct EntitlementRow {
    id: String,
    is_entitled: bool,
    entitlement_expires_at: Option<DateTime<Utc>>,
    entitlement_subscription_id: Option<Uuid>,
    entitlement_computed_at: Option<DateTime<Utc>>,
}

impl EntitlementRow {
    /// `None` until a unit has written the projection for this user.
    pub(super) fn into_entitlement(self) -> Result<Option<Entitlement>, DomainError> {
        let Some(computed_at) = self.entitlement_computed_at else {
            return Ok(None);
        };
        Ok(Some(Entitlement {
            user_id: UserId::new(self.id).map_err(|e| corrupt("user id", e))?,
            is_entitled: self.is_entitled,
            expires_at: self.entitlement_expires_at.map(ts),
            subscription_id: self.entitlement_subscription_id.map(SubscriptionId::from_uuid),
            computed_at: ts(computed_at),
        }))
    }
}

/// Inserts one event log entry inside `tx`.
pub(super) async fn insert_event(tx: &mut Tx<'_>, event: &SubscriptionEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subscription_events (
            id, subscription_id, user_id, kind, source, outcome, previous_status, new_status,
            notification_id, payload, occurred_at, recorded_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(event.id.as_uuid())
    .bind(event.subscription_id.map(|id| *id.as_uuid()))
    .bind(event.user_id.as_ref().map(|u| u.as_str().to_string()))
    .bind(&event.kind)
    .bind(event.source.as_str())
    .bind(event.outcome.as_str())
    .bind(event.previous_status.map(|s| s.as_str()))
    .bind(event.new_status.map(|s| s.as_str()))
    .bind(&event.notification_id)
    .bind(&event.payload)
    .bind(event.occurred_at.as_datetime())
    .bind(event.recorded_at.as_datetime())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
