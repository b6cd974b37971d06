//! Adapters - Implementations of port interfaces.
//!
//! - `catalog` - product catalog loaded from YAML
//! - `http` - axum routes for webhooks and the billing API
//! - `memory` - in-process ledger, queue and clock
//! - `postgres` - PostgreSQL ledger, event log and operator queue
//! - `stores` - store server API clients

pub mod catalog;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod stores;
