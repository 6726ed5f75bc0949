// Origin allow-list and CORS grant for the companion browser extension.

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::ApiError;

/// Scheme prefix identifying the companion extension.
pub const EXTENSION_ORIGIN_PREFIX: &str = "chrome-extension://";

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Codex-Blocker-Token";

pub fn is_extension_origin(origin: &str) -> bool {
    origin.starts_with(EXTENSION_ORIGIN_PREFIX)
}

/// The request's `Origin` header, if present and valid UTF-8.
pub fn request_origin(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
}

/// Grant CORS to the extension origin and answer preflight requests.
///
/// Logic:
/// - Extension origin: CORS headers are added to whatever response follows
/// - Any other origin (or none): no grant, request continues to auth
/// - `OPTIONS`: 204 for the extension, 403 otherwise; never reaches auth
pub async fn cors(req: Request, next: Next) -> Response {
    let allowed = request_origin(&req)
        .filter(|o| is_extension_origin(o))
        .and_then(|o| HeaderValue::from_str(o).ok());

    let mut response = if req.method() == Method::OPTIONS {
        match allowed {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => ApiError::OriginNotAllowed.into_response(),
        }
    } else {
        next.run(req).await
    };

    if let Some(origin) = allowed {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        );
    }
    response
}
