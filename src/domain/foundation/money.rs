//! Monetary amounts in integer minor units.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ValidationError;

/// A signed amount in the currency's minor unit (cents for EUR/USD).
///
/// Refunds and chargebacks carry negative amounts; charges are positive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: String,
}

impl Money {
    /// Creates an amount, normalizing the currency code to upper case.
    pub fn new(amount_minor: i64, currency: impl AsRef<str>) -> Result<Self, ValidationError> {
        let currency = currency.as_ref().trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::invalid_format(
                "currency",
                format!("'{}' is not an ISO-4217 code", currency),
            ));
        }
        Ok(Self {
            amount_minor,
            currency,
        })
    }

    pub fn zero(currency: impl AsRef<str>) -> Result<Self, ValidationError> {
        Self::new(0, currency)
    }

    /// Converts store micro-units (1/1_000_000) into minor units.
    pub fn from_micros(micros: i64, currency: impl AsRef<str>) -> Result<Self, ValidationError> {
        Self::new(micros / 10_000, currency)
    }

    /// Converts store milli-units (1/1_000) into minor units.
    pub fn from_millis(millis: i64, currency: impl AsRef<str>) -> Result<Self, ValidationError> {
        Self::new(millis / 10, currency)
    }

    pub fn is_zero(&self) -> bool {
        self.amount_minor == 0
    }

    pub fn negated(&self) -> Self {
        Self {
            amount_minor: -self.amount_minor,
            currency: self.currency.clone(),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.amount_minor < 0 { "-" } else { "" };
        let abs = self.amount_minor.unsigned_abs();
        write!(f, "{}{}.{:02} {}", sign, abs / 100, abs % 100, self.currency)
    }
}
