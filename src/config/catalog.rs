//! Product catalog configuration

use serde::Deserialize;
use std::path::PathBuf;

use super::error::ValidationError;

/// Where the product catalog is read from
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// YAML file listing products and their store product ids
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { path: default_path() }
    }
}

impl CatalogConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.path.as_os_str().is_empty() {
            return Err(ValidationError::MissingRequired("CATALOG__PATH"));
        }
        Ok(())
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("config/products.yaml")
}
