//! Catalog products as seen by billing.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{Money, ProductId, Timestamp};

use super::Store;

/// Store-specific identifiers of one catalog product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreProductIds {
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default, rename = "appstore")]
    pub app_store: Option<String>,
    #[serde(default)]
    pub web: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub billing_period_days: u32,
    pub price: Money,
    #[serde(default)]
    pub store_product_ids: StoreProductIds,
}

impl Product {
    pub fn store_product_id(&self, store: Store) -> Option<&str> {
        match store {
            Store::Mobile => self.store_product_ids.mobile.as_deref(),
            Store::AppStore => self.store_product_ids.app_store.as_deref(),
            Store::Web => self.store_product_ids.web.as_deref(),
        }
    }

    /// Whether `store_product_id` names this product in `store`.
    ///
    /// Web payments may also reference the catalog id directly.
    pub fn is_sold_as(&self, store: Store, store_product_id: &str) -> bool {
        self.store_product_id(store) == Some(store_product_id)
            || (store == Store::Web && self.id.as_str() == store_product_id)
    }

    /// Period end for a purchase made at `start` when the store did not report one.
    pub fn period_end_from(&self, start: Timestamp) -> Timestamp {
        start.plus_days(i64::from(self.billing_period_days))
    }
}
