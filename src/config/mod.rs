//! Application configuration module
//!
//! Type-safe configuration loaded from environment variables with the
//! `config` and `dotenvy` crates. Variables use the `MARKETPLACE_BILLING`
//! prefix and `__` between nested keys.
//!
//! # Example
//!
//! ```no_run
//! use marketplace_billing::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//! ```

mod catalog;
mod database;
mod error;
mod server;
mod stores;
mod workers;

pub use catalog::CatalogConfig;
pub use database::DatabaseConfig;
pub use error::{ConfigError, ValidationError};
pub use server::{Environment, ServerConfig};
pub use stores::{
    AppStoreConfig, MobileStoreConfig, StoreClientConfig, StoresConfig, WebGatewayConfig,
};
pub use workers::WorkersConfig;

use serde::Deserialize;

/// Root application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port, environment, logging)
    #[serde(default)]
    pub server: ServerConfig,

    /// PostgreSQL ledger; absent means the in-memory ledger
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Store integrations
    #[serde(default)]
    pub stores: StoresConfig,

    /// Reconciliation and expiration sweep
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Product catalog source
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// 1. Loads `.env` if present (development)
    /// 2. Reads variables with the `MARKETPLACE_BILLING` prefix
    /// 3. Splits nested keys on `__`
    ///
    /// # Environment Variable Format
    ///
    /// - `MARKETPLACE_BILLING__SERVER__PORT=8080` -> `server.port = 8080`
    /// - `MARKETPLACE_BILLING__STORES__WEB__API_KEY=...` -> `stores.web.api_key = ...`
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("MARKETPLACE_BILLING")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    ///
    /// Production additionally requires a database and HTTPS store endpoints.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        match &self.database {
            Some(database) => database.validate()?,
            None if self.is_production() => return Err(ValidationError::DatabaseRequiredInProduction),
            None => {}
        }
        self.stores.validate(&self.server.environment)?;
        self.workers.validate()?;
        self.catalog.validate()?;
        Ok(())
    }

    /// Check if running in production environment
    pub fn is_production(&self) -> bool {
        self.server.is_production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::env;
    use std::sync::Mutex;

    // env vars are process-global
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "MARKETPLACE_BILLING__DATABASE__URL",
        "MARKETPLACE_BILLING__STORES__WEB__API_KEY",
        "MARKETPLACE_BILLING__STORES__WEB__WEBHOOK_SECRET",
        "MARKETPLACE_BILLING__SERVER__PORT",
        "MARKETPLACE_BILLING__SERVER__ENVIRONMENT",
        "MARKETPLACE_BILLING__WORKERS__SWEEP_INTERVAL_SECS",
    ];

    fn set_minimal_env() {
        env::set_var("MARKETPLACE_BILLING__DATABASE__URL", "postgresql://test@localhost/test");
        env::set_var("MARKETPLACE_BILLING__STORES__WEB__API_KEY", "gk_test_xxx");
        env::set_var("MARKETPLACE_BILLING__STORES__WEB__WEBHOOK_SECRET", "whsec_xxx");
    }

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_load_from_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = AppConfig::load();
        clear_env();

        assert!(result.is_ok(), "Failed to load config: {:?}", result.err());
        let config = result.unwrap();
        assert_eq!(
            config.database.map(|d| d.display_target()),
            Some("localhost/test".to_string())
        );
        let web = config.stores.web.unwrap();
        assert_eq!(web.api_key.expose_secret(), "gk_test_xxx");
        assert!(config.stores.mobile.is_none());
    }

    #[test]
    fn test_validate_full_config() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_without_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = AppConfig::load().unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.environment, Environment::Development);
        assert!(config.database.is_none());
        assert!(!config.stores.any_configured());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_requires_database() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("MARKETPLACE_BILLING__SERVER__ENVIRONMENT", "production");
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert!(config.is_production());
        assert_eq!(config.validate(), Err(ValidationError::DatabaseRequiredInProduction));
    }

    #[test]
    fn test_nested_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        set_minimal_env();
        env::set_var("MARKETPLACE_BILLING__SERVER__PORT", "3000");
        env::set_var("MARKETPLACE_BILLING__WORKERS__SWEEP_INTERVAL_SECS", "600");
        let result = AppConfig::load();
        clear_env();

        let config = result.unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.workers.sweep_interval_secs, 600);
    }
}
