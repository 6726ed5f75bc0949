use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::origin;

/// Alternate header carrying the token.
pub const TOKEN_HEADER: &str = "x-codex-blocker-token";

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    let auth_str = req.headers().get("authorization")?.to_str().ok()?;
    let token = auth_str.strip_prefix("Bearer ")?.trim();
    non_empty(token)
}

/// Extract a percent-decoded `?token=` value from the query string.
fn extract_query(req: &Request) -> Option<String> {
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(req.uri()).ok()?;
    pairs
        .into_iter()
        .find(|(key, _)| key == "token")
        .and_then(|(_, value)| non_empty(&value))
}

/// Extract the token from the alternate custom header.
fn extract_header(req: &Request) -> Option<String> {
    let value = req.headers().get(TOKEN_HEADER)?.to_str().ok()?;
    non_empty(value)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// The token presented by a request: Authorization header, then `?token=`,
/// then the custom header.
pub fn extract_token(req: &Request) -> Option<String> {
    extract_bearer(req)
        .or_else(|| extract_query(req))
        .or_else(|| extract_header(req))
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("failed to persist token to {}: {1}", .0.display())]
    WriteFailed(PathBuf, #[source] std::io::Error),
}

/// The shared secret between this server and its client, established on
/// first use.
///
/// Until a token is persisted, the first request that presents a token from
/// the trusted extension origin defines it. From then on every request must
/// present exactly that token. Check-and-persist runs under one lock so two
/// simultaneous first requests cannot both establish different tokens in
/// this process.
pub struct TokenStore {
    path: PathBuf,
    token: Mutex<Option<String>>,
}

impl TokenStore {
    /// Load the persisted token from `path`, if any. A missing, unreadable,
    /// or empty file means no token yet.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let token = read_token(&path);
        if token.is_some() {
            crate::config::check_config_permissions(&path);
            tracing::debug!(path = %path.display(), "loaded persisted token");
        }
        Self {
            path,
            token: Mutex::new(token),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_established(&self) -> bool {
        self.token.lock().is_some()
    }

    /// Validate `provided` and, when no token exists yet, adopt it if the
    /// request came from the trusted origin.
    pub fn authorize(&self, provided: Option<&str>, trusted_origin: bool) -> Result<(), ApiError> {
        let mut current = self.token.lock();
        if let Some(expected) = current.as_deref() {
            return match provided {
                Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => Ok(()),
                Some(_) => Err(ApiError::AuthInvalid),
                None => Err(ApiError::AuthRequired),
            };
        }
        match provided {
            Some(token) if trusted_origin => {
                if let Err(e) = persist_token(&self.path, token) {
                    tracing::warn!(error = %e, "token accepted but not persisted");
                } else {
                    tracing::info!(path = %self.path.display(), "client token established");
                }
                *current = Some(token.to_string());
                Ok(())
            }
            _ => Err(ApiError::AuthRequired),
        }
    }
}

fn read_token(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let token = contents.trim();
    non_empty(token)
}

fn persist_token(path: &Path, token: &str) -> Result<(), TokenError> {
    let write_failed = |e| TokenError::WriteFailed(path.to_path_buf(), e);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_failed)?;
    }
    std::fs::write(path, token).map_err(write_failed)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(write_failed)?;
    }
    Ok(())
}

/// Auth middleware function.
///
/// Runs after the origin layer, so preflight requests never reach it.
pub async fn require_auth(
    State(tokens): State<Arc<TokenStore>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = extract_token(&req);
    let trusted = origin::request_origin(&req).is_some_and(origin::is_extension_origin);
    tokens.authorize(provided.as_deref(), trusted)?;
    Ok(next.run(req).await)
}
