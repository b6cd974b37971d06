//! Payment records: one row per financial movement.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::foundation::{
    Money, PaymentRecordId, SubscriptionId, Timestamp, UserId, ValidationError,
};

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Charge,
    Refund,
    Chargeback,
    Proration,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Charge => "charge",
            TransactionType::Refund => "refund",
            TransactionType::Chargeback => "chargeback",
            TransactionType::Proration => "proration",
        }
    }

    /// Money flowing back to the customer carries a negative amount.
    pub fn is_outflow(&self) -> bool {
        matches!(self, TransactionType::Refund | TransactionType::Chargeback)
    }
}

impl FromStr for TransactionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "charge" => Ok(TransactionType::Charge),
            "refund" => Ok(TransactionType::Refund),
            "chargeback" => Ok(TransactionType::Chargeback),
            "proration" => Ok(TransactionType::Proration),
            other => Err(ValidationError::invalid_format(
                "transaction_type",
                format!("unknown transaction type '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
    Pending,
    Failed,
    Reversed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Reversed => "reversed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(PaymentStatus::Completed),
            "pending" => Ok(PaymentStatus::Pending),
            "failed" => Ok(PaymentStatus::Failed),
            "reversed" => Ok(PaymentStatus::Reversed),
            other => Err(ValidationError::invalid_format(
                "payment_status",
                format!("unknown payment status '{}'", other),
            )),
        }
    }
}

/// Idempotency key of a payment: unique per store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentKey {
    pub store: Store,
    pub store_transaction_id: String,
}

impl PaymentKey {
    pub fn new(store: Store, store_transaction_id: impl Into<String>) -> Self {
        Self {
            store,
            store_transaction_id: store_transaction_id.into(),
        }
    }

    /// Key of the refund booked against a charge.
    ///
    /// Stores reuse the charge's transaction id on refunds, so the refund gets
    /// its own namespace to keep `(store, id)` unique.
    pub fn refund_of(store: Store, charge_transaction_id: &str) -> Self {
        Self::new(store, format!("refund:{}", charge_transaction_id))
    }
}

impl fmt::Display for PaymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store, self.store_transaction_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentRecordId,
    pub user_id: UserId,
    pub subscription_id: SubscriptionId,
    pub key: PaymentKey,
    pub transaction_type: TransactionType,
    /// Signed: negative for refunds and chargebacks.
    pub amount: Money,
    pub status: PaymentStatus,
    pub transaction_date: Timestamp,
    pub exported: bool,
    pub reconciled: bool,
    pub created_at: Timestamp,
}

impl PaymentRecord {
    /// Books a completed movement. The sign of `amount` is normalized from
    /// the transaction type.
    pub fn completed(
        user_id: UserId,
        subscription_id: SubscriptionId,
        key: PaymentKey,
        transaction_type: TransactionType,
        amount: Money,
        transaction_date: Timestamp,
        now: Timestamp,
    ) -> Self {
        let magnitude = amount.amount_minor.abs();
        let amount = Money {
            amount_minor: if transaction_type.is_outflow() {
                -magnitude
            } else {
                magnitude
            },
            currency: amount.currency,
        };
        Self {
            id: PaymentRecordId::new(),
            user_id,
            subscription_id,
            key,
            transaction_type,
            amount,
            status: PaymentStatus::Completed,
            transaction_date,
            exported: false,
            reconciled: false,
            created_at: now,
        }
    }
}
