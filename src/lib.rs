//! Marketplace Billing - unified subscription ledger for multiple stores.
//!
//! Normalizes lifecycle notifications from the mobile store, the app store
//! and the web card gateway into one ledger, keeps each user's entitlement
//! consistent with it, and reconciles the ledger against the stores.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod startup;
