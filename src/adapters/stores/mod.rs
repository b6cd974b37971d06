//! Store billing API adapters.
//!
//! - `mobile` - mobile store publisher API
//! - `app_store` - app store server API (ES256 bearer tokens)
//! - `web_gateway` - first-party card gateway
//! - `retry` - timeout and backoff decorator for any client
//! - `scripted` - scripted client for tests and local runs

mod app_store;
mod http;
mod mobile;
mod retry;
mod scripted;
mod web_gateway;

pub use app_store::{AppStoreClient, AppStoreClientConfig};
pub use mobile::{MobileStoreClient, MobileStoreClientConfig};
pub use retry::{with_retry, RetryConfig, RetryingStoreClient};
pub use scripted::{ScriptedStoreClient, StoreCall};
pub use web_gateway::{WebGatewayClient, WebGatewayClientConfig};
