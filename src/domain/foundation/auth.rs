//! Authenticated principal for the domain layer.
//!
//! An external identity middleware authenticates the request and forwards the
//! caller as headers. The HTTP adapter turns those into an
//! [`AuthenticatedUser`]; nothing here knows how authentication happened.

use super::UserId;
use thiserror::Error;

/// Role that may issue refunds and read the operator queue.
pub const ADMIN_ROLE: &str = "admin";

/// Caller of a user-facing billing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: UserId,
    pub roles: Vec<String>,
}

impl AuthenticatedUser {
    pub fn new(id: UserId, roles: Vec<String>) -> Self {
        Self { id, roles }
    }

    /// Parses a comma-separated role list as sent by the identity middleware.
    pub fn with_role_header(id: UserId, header: Option<&str>) -> Self {
        let roles = header
            .map(|h| {
                h.split(',')
                    .map(|r| r.trim().to_ascii_lowercase())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self { id, roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No principal was forwarded.
    #[error("Missing authenticated principal")]
    Unauthenticated,

    /// The forwarded principal is not a valid user id.
    #[error("Invalid principal: {0}")]
    InvalidPrincipal(String),
}
