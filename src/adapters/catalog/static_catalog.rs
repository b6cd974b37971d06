//! Product catalog loaded from a YAML file.
//!
//! The catalog changes rarely and is small; it is read once at startup and
//! held in memory.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::fs;

use crate::domain::billing::{Product, Store};
use crate::domain::foundation::{DomainError, ErrorCode, ProductId};
use crate::ports::ProductCatalog;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    products: Vec<Product>,
}

/// In-memory catalog, keyed by catalog id.
#[derive(Debug, Clone, Default)]
pub struct StaticProductCatalog {
    products: HashMap<ProductId, Product>,
}

impl StaticProductCatalog {
    /// Builds a catalog from products, rejecting duplicates and empty periods.
    pub fn from_products(products: Vec<Product>) -> Result<Self, DomainError> {
        let mut seen_store_ids = HashSet::new();
        let mut by_id = HashMap::new();

        for product in products {
            ProductId::new(product.id.as_str())?;
            if product.billing_period_days == 0 {
                return Err(DomainError::validation(
                    "billing_period_days",
                    format!("product {} has an empty billing period", product.id),
                ));
            }
            for store in Store::ALL {
                if let Some(store_id) = product.store_product_id(store) {
                    if !seen_store_ids.insert((store, store_id.to_string())) {
                        return Err(DomainError::validation(
                            "store_product_ids",
                            format!("{} product id '{}' is used twice", store, store_id),
                        ));
                    }
                }
            }
            let id = product.id.clone();
            if by_id.insert(id.clone(), product).is_some() {
                return Err(DomainError::validation("id", format!("product {} is listed twice", id)));
            }
        }

        Ok(Self { products: by_id })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, DomainError> {
        let file: CatalogFile = serde_yaml::from_str(yaml).map_err(|e| {
            DomainError::new(ErrorCode::InvalidFormat, format!("catalog is not valid YAML: {}", e))
        })?;
        Self::from_products(file.products)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, DomainError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).await.map_err(|e| {
            DomainError::new(
                ErrorCode::InternalError,
                format!("failed to read catalog {}: {}", path.display(), e),
            )
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

#[async_trait]
impl ProductCatalog for StaticProductCatalog {
    async fn find_by_id(&self, id: &ProductId) -> Result<Option<Product>, DomainError> {
        Ok(self.products.get(id).cloned())
    }

    async fn find_by_store_product(
        &self,
        store: Store,
        store_product_id: &str,
    ) -> Result<Option<Product>, DomainError> {
        Ok(self
            .products
            .values()
            .find(|p| p.is_sold_as(store, store_product_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CATALOG: &str = r#"
products:
  - id: premium_monthly
    name: Premium (monthly)
    billing_period_days: 30
    price: { amount_minor: 499, currency: EUR }
    store_product_ids:
      mobile: premium_monthly
      appstore: com.marketplace.premium.monthly
      web: price_monthly
  - id: premium_yearly
    name: Premium (yearly)
    billing_period_days: 365
    price: { amount_minor: 4999, currency: EUR }
    store_product_ids:
      mobile: premium_yearly
"#;

    #[tokio::test]
    async fn finds_products_by_store_id() {
        let catalog = StaticProductCatalog::from_yaml_str(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);

        let monthly = catalog
            .find_by_store_product(Store::AppStore, "com.marketplace.premium.monthly")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(monthly.id.as_str(), "premium_monthly");

        assert!(catalog
            .find_by_store_product(Store::AppStore, "premium_yearly")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("products.yaml");
        std::fs::write(&path, CATALOG).unwrap();

        let catalog = StaticProductCatalog::load(&path).await.unwrap();
        let yearly = catalog
            .find_by_id(&ProductId::new("premium_yearly").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(yearly.billing_period_days, 365);
    }

    #[test]
    fn rejects_reused_store_product_ids() {
        let yaml = r#"
products:
  - id: a
    name: A
    billing_period_days: 30
    price: { amount_minor: 100, currency: EUR }
    store_product_ids: { mobile: same }
  - id: b
    name: B
    billing_period_days: 30
    price: { amount_minor: 100, currency: EUR }
    store_product_ids: { mobile: same }
"#;
        assert!(StaticProductCatalog::from_yaml_str(yaml).is_err());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(StaticProductCatalog::load(dir.path().join("nope.yaml")).await.is_err());
    }
}
