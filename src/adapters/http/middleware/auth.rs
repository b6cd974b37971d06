//! Principal extraction for axum.
//!
//! The identity service in front of this one authenticates the caller and
//! forwards the principal as headers:
//!
//! ```text
//! X-User-Id: <user id>
//! X-User-Roles: admin,support
//! ```
//!
//! Handlers take [`RequireAuth`] to get the caller as an
//! [`AuthenticatedUser`]; a missing or malformed id answers 401.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::domain::foundation::{AuthError, AuthenticatedUser, UserId};

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_ROLES_HEADER: &str = "X-User-Roles";

/// Rejection for [`RequireAuth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRejection(pub AuthError);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let message = match &self.0 {
            AuthError::Unauthenticated => "Authentication is required".to_string(),
            AuthError::InvalidPrincipal(reason) => format!("Invalid principal: {}", reason),
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error_code": "AUTHENTICATION_REQUIRED",
                "message": message,
            })),
        )
            .into_response()
    }
}

/// Extractor that requires a forwarded principal.
#[derive(Debug, Clone)]
pub struct RequireAuth(pub AuthenticatedUser);

#[async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        principal_from_parts(parts).map(RequireAuth).map_err(AuthRejection)
    }
}

fn principal_from_parts(parts: &Parts) -> Result<AuthenticatedUser, AuthError> {
    let raw_id = parts
        .headers
        .get(USER_ID_HEADER)
        .ok_or(AuthError::Unauthenticated)?
        .to_str()
        .map_err(|_| AuthError::InvalidPrincipal("user id is not valid ASCII".into()))?;
    let id = UserId::new(raw_id.trim()).map_err(|e| AuthError::InvalidPrincipal(e.to_string()))?;

    let roles = parts
        .headers
        .get(USER_ROLES_HEADER)
        .and_then(|v| v.to_str().ok());

    Ok(AuthenticatedUser::with_role_header(id, roles))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/api/billing/entitlement");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn extracts_user_and_roles() {
        let mut parts = parts(&[(USER_ID_HEADER, "user-1"), (USER_ROLES_HEADER, "Admin, support")]);
        let RequireAuth(user) = RequireAuth::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user.id.as_str(), "user-1");
        assert!(user.is_admin());
        assert!(user.has_role("support"));
    }

    #[tokio::test]
    async fn missing_header_is_unauthenticated() {
        let mut parts = parts(&[]);
        let err = RequireAuth::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(err, AuthRejection(AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn blank_user_id_is_rejected() {
        let mut parts = parts(&[(USER_ID_HEADER, "   ")]);
        let err = RequireAuth::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert!(matches!(err.0, AuthError::InvalidPrincipal(_)));
    }
}
