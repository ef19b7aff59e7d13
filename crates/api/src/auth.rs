//! Caller identity
//!
//! Authentication happens upstream; the gateway in front of this service
//! forwards the authenticated user id in `x-user-id`.

use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated user, inserted as a request extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);

fn user_from_headers(headers: &HeaderMap) -> Option<CurrentUser> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .map(CurrentUser)
}

/// Middleware that rejects requests without a valid user id
pub async fn require_user(mut request: Request, next: Next) -> Response {
    match user_from_headers(request.headers()) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "require_user: missing or invalid user id");
            ApiError::Unauthorized.into_response()
        }
    }
}
