//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required configuration missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid listen address")]
    InvalidAddress,

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid request timeout")]
    InvalidTimeout,

    #[error("Invalid database URL format")]
    InvalidDatabaseUrl,

    #[error("Pool bounds are invalid")]
    InvalidPoolSize,

    #[error("Pool size exceeds maximum allowed (100)")]
    PoolSizeTooLarge,

    #[error("A database is required in production")]
    DatabaseRequiredInProduction,

    #[error("Store API base URL must use HTTPS: {0}")]
    StoreUrlMustBeHttps(&'static str),

    #[error("Invalid web gateway API key format")]
    InvalidGatewayKey,

    #[error("Invalid web gateway webhook secret format")]
    InvalidGatewayWebhookSecret,

    #[error("Invalid store client retry settings")]
    InvalidRetrySettings,

    #[error("Invalid worker setting: {0}")]
    InvalidWorkerSetting(&'static str),

    #[error("Wildcard CORS origin is not allowed in production")]
    WildcardCorsInProduction,
}
