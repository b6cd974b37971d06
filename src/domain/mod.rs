//! Domain layer containing business logic and domain types.
//!
//! # Module Organization
//!
//! - `foundation` - Shared domain primitives (IDs, money, timestamps, errors)
//! - `billing` - Subscription lifecycle, payments, entitlement and store notifications

pub mod billing;
pub mod foundation;
