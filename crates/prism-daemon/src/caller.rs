//! Caller identity extractors.
//!
//! Authentication happens in front of the daemon; the fronting proxy passes
//! the authenticated user in `x-prism-user` and, for the administrative
//! routes, the operator name in `x-prism-operator`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use prism_core::UserId;

use crate::error::ApiError;

/// Header carrying the authenticated user's id.
pub const USER_HEADER: &str = "x-prism-user";

/// Header carrying the operator name on administrative routes.
pub const OPERATOR_HEADER: &str = "x-prism-operator";

/// The user making a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// The user's id.
    pub user_id: UserId,
}

/// The operator making an administrative request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    /// Operator name, kept in the audit log.
    pub name: String,
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = header(parts, USER_HEADER).ok_or(ApiError::Unauthorized("missing x-prism-user"))?;
        let user_id = raw
            .parse()
            .map_err(|_| ApiError::Unauthorized("x-prism-user is not a valid user id"))?;
        Ok(Self { user_id })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Operator
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let name = header(parts, OPERATOR_HEADER)
            .ok_or(ApiError::Unauthorized("missing x-prism-operator"))?;
        Ok(Self {
            name: name.to_string(),
        })
    }
}
