use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for all gateway rejections.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers and
/// middleware can return `Result<T, ApiError>` directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// 401 - No token, or no token persisted yet and the request cannot
    /// establish one.
    AuthRequired,
    /// 401 - A token was presented but does not match.
    AuthInvalid,
    /// 403 - Preflight from an origin that is not the companion extension.
    OriginNotAllowed,
    /// 404 - No such route.
    NotFound,
    /// 429 - Per-IP request budget exhausted for the current window.
    RateLimited,
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::NotFound => "not_found",
            ApiError::RateLimited => "rate_limited",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header, ?token= query parameter, or X-Codex-Blocker-Token header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::OriginNotAllowed => "Origin not allowed.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::RateLimited => "Too many requests. Try again later.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
