//! HTTP middleware and extractors for axum.
//!
//! - `auth` - principal extraction from identity headers

pub mod auth;

pub use auth::{AuthRejection, RequireAuth, USER_ID_HEADER, USER_ROLES_HEADER};
