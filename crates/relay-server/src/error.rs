//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::HubError;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

/// Errors returned by HTTP handlers and middleware.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid token.
    #[error("unauthorized")]
    Unauthorized(#[from] AuthError),

    /// The request is malformed.
    #[error("{0}")]
    BadRequest(String),

    /// The caller is over its rate limit.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The hub has stopped.
    #[error("hub unavailable")]
    Unavailable(#[from] HubError),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::RateLimited => (status, self.to_string()).into_response(),
            _ => (status, Json(json!({ "error": self.to_string() }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::from(AuthError::MissingToken).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::BadRequest("bad room".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::from(HubError::Closed).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_auth_detail_not_exposed() {
        let err = ApiError::from(AuthError::EmptySubject);
        assert_eq!(err.to_string(), "unauthorized");
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
