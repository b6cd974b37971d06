//! Store integration configuration
//!
//! Each store section is optional. A store without a section gets neither a
//! webhook normalizer nor an API client; its notifications answer 503.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;
use super::server::Environment;

/// All store integrations plus the shared client behavior
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoresConfig {
    /// Mobile store (publisher API + push notifications)
    pub mobile: Option<MobileStoreConfig>,

    /// App store (server API + signed notifications)
    pub app_store: Option<AppStoreConfig>,

    /// First-party card gateway
    pub web: Option<WebGatewayConfig>,

    /// Timeouts and retries for every store API call
    #[serde(default)]
    pub client: StoreClientConfig,
}

/// Mobile store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MobileStoreConfig {
    #[serde(default = "default_mobile_api_url")]
    pub api_base_url: String,

    /// Application package notifications must belong to
    pub package_name: String,

    /// Publisher API bearer token
    pub access_token: SecretString,

    /// Key used to verify the signed purchase payload
    pub signing_key: SecretString,
}

/// App store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppStoreConfig {
    #[serde(default = "default_app_store_api_url")]
    pub api_base_url: String,

    pub bundle_id: String,
    pub issuer_id: String,
    pub key_id: String,

    /// PKCS#8 PEM of the API signing key
    pub private_key_pem: SecretString,

    /// Base64 DER (SPKI) of the pinned notification signing key
    pub notification_public_key: String,
}

/// Web gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebGatewayConfig {
    #[serde(default = "default_web_api_url")]
    pub api_base_url: String,

    /// Gateway API key
    pub api_key: SecretString,

    /// Webhook signing secret
    pub webhook_secret: SecretString,
}

/// Shared store client behavior
#[derive(Debug, Clone, Deserialize)]
pub struct StoreClientConfig {
    /// Deadline for one store API call, in seconds
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt on transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff, in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap, in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_call_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl StoreClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_secs == 0 || self.timeout_secs > 120 {
            return Err(ValidationError::InvalidTimeout);
        }
        if self.max_retries > 10 || self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ValidationError::InvalidRetrySettings);
        }
        Ok(())
    }
}

impl StoresConfig {
    /// Whether at least one store is configured
    pub fn any_configured(&self) -> bool {
        self.mobile.is_some() || self.app_store.is_some() || self.web.is_some()
    }

    /// Validate store configuration
    ///
    /// Production requires HTTPS for every store API.
    pub fn validate(&self, environment: &Environment) -> Result<(), ValidationError> {
        self.client.validate()?;
        let production = *environment == Environment::Production;

        if let Some(mobile) = &self.mobile {
            if mobile.package_name.is_empty() {
                return Err(ValidationError::MissingRequired("STORES__MOBILE__PACKAGE_NAME"));
            }
            if mobile.access_token.expose_secret().is_empty() {
                return Err(ValidationError::MissingRequired("STORES__MOBILE__ACCESS_TOKEN"));
            }
            if mobile.signing_key.expose_secret().is_empty() {
                return Err(ValidationError::MissingRequired("STORES__MOBILE__SIGNING_KEY"));
            }
            require_https(production, &mobile.api_base_url, "STORES__MOBILE__API_BASE_URL")?;
        }

        if let Some(app_store) = &self.app_store {
            if app_store.bundle_id.is_empty() {
                return Err(ValidationError::MissingRequired("STORES__APP_STORE__BUNDLE_ID"));
            }
            if app_store.issuer_id.is_empty() || app_store.key_id.is_empty() {
                return Err(ValidationError::MissingRequired("STORES__APP_STORE__KEY_ID"));
            }
            if app_store.notification_public_key.is_empty() {
                return Err(ValidationError::MissingRequired(
                    "STORES__APP_STORE__NOTIFICATION_PUBLIC_KEY",
                ));
            }
            require_https(production, &app_store.api_base_url, "STORES__APP_STORE__API_BASE_URL")?;
        }

        if let Some(web) = &self.web {
            // Gateway keys carry a mode prefix, like the card processors they front
            if !web.api_key.expose_secret().starts_with("gk_") {
                return Err(ValidationError::InvalidGatewayKey);
            }
            if !web.webhook_secret.expose_secret().starts_with("whsec_") {
                return Err(ValidationError::InvalidGatewayWebhookSecret);
            }
            require_https(production, &web.api_base_url, "STORES__WEB__API_BASE_URL")?;
        }

        Ok(())
    }
}

fn require_https(production: bool, url: &str, name: &'static str) -> Result<(), ValidationError> {
    if production && !url.starts_with("https://") {
        return Err(ValidationError::StoreUrlMustBeHttps(name));
    }
    Ok(())
}

fn default_mobile_api_url() -> String {
    "https://androidpublisher.googleapis.com".to_string()
}

fn default_app_store_api_url() -> String {
    "https://api.storekit.itunes.apple.com".to_string()
}

fn default_web_api_url() -> String {
    "https://api.gateway.example.com".to_string()
}

fn default_call_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    10_000
}
