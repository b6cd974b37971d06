//! Product catalog port.
//!
//! Pricing tables live elsewhere; billing only needs to resolve the product a
//! store purchase refers to and the period length to fall back on.

use async_trait::async_trait;

use crate::domain::billing::{Product, Store};
use crate::domain::foundation::{DomainError, ProductId};

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Find a product by catalog id.
    async fn find_by_id(&self, id: &ProductId) -> Result<Option<Product>, DomainError>;

    /// Find the product a store sells under `store_product_id`.
    async fn find_by_store_product(
        &self,
        store: Store,
        store_product_id: &str,
    ) -> Result<Option<Product>, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_catalog_is_object_safe() {
        fn _accepts_dyn(_catalog: &dyn ProductCatalog) {}
    }
}
