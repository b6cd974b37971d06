//! Billing stores and their correlation keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::foundation::ValidationError;

/// Originating billing platform of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Store {
    /// Mobile-store billing (purchase tokens, push-delivered notifications).
    Mobile,
    /// App-store billing (signed JWS notifications, original transaction ids).
    #[serde(rename = "appstore")]
    AppStore,
    /// First-party web payments through the card gateway.
    Web,
}

impl Store {
    pub const ALL: [Store; 3] = [Store::Mobile, Store::AppStore, Store::Web];

    pub fn as_str(&self) -> &'static str {
        match self {
            Store::Mobile => "mobile",
            Store::AppStore => "appstore",
            Store::Web => "web",
        }
    }

    /// Whether the store exposes a live validation endpoint used by reconciliation.
    pub fn supports_remote_validation(&self) -> bool {
        !matches!(self, Store::Web)
    }

    /// Pausing is a mobile-store-only feature.
    pub fn supports_pause(&self) -> bool {
        matches!(self, Store::Mobile)
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Store {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(Store::Mobile),
            "appstore" => Ok(Store::AppStore),
            "web" => Ok(Store::Web),
            other => Err(ValidationError::invalid_format(
                "store",
                format!("unknown store '{}'", other),
            )),
        }
    }
}

/// Store-specific identifier linking a local subscription to one external
/// billing record.
///
/// The variant is fixed by the store, so a subscription always carries
/// exactly one correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoreRef {
    PurchaseToken(String),
    OriginalTransactionId(String),
    GatewaySubscriptionId(String),
}

impl StoreRef {
    /// Builds the correlation key variant belonging to `store`.
    pub fn for_store(store: Store, key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ValidationError::empty_field("correlation_key"));
        }
        Ok(match store {
            Store::Mobile => StoreRef::PurchaseToken(key),
            Store::AppStore => StoreRef::OriginalTransactionId(key),
            Store::Web => StoreRef::GatewaySubscriptionId(key),
        })
    }

    pub fn store(&self) -> Store {
        match self {
            StoreRef::PurchaseToken(_) => Store::Mobile,
            StoreRef::OriginalTransactionId(_) => Store::AppStore,
            StoreRef::GatewaySubscriptionId(_) => Store::Web,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StoreRef::PurchaseToken(k)
            | StoreRef::OriginalTransactionId(k)
            | StoreRef::GatewaySubscriptionId(k) => k,
        }
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store(), self.key())
    }
}
