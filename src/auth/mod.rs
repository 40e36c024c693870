//! Dashboard authentication: a single constant-time API key check.
//! Uses the same state-extraction / `Result<Response, AuthError>` /
//! `IntoResponse`-for-the-error shape as a JWT middleware would, minus
//! the claims machinery, since the dashboard has no per-user identity,
//! only an operator shared secret.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Clone)]
pub struct ApiKeyState {
    pub api_key: Option<String>,
}

#[derive(Debug)]
pub struct AuthError;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid or missing API key" }))).into_response()
    }
}

/// Constant-time comparison so key length/prefix isn't leaked via timing.
fn keys_match(provided: &str, configured: &str) -> bool {
    let a = provided.as_bytes();
    let b = configured.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn extract_key(req: &Request<Body>) -> Option<String> {
    if let Some(header) = req.headers().get("x-api-key") {
        if let Ok(s) = header.to_str() {
            return Some(s.to_string());
        }
    }
    let query = req.uri().query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("api_key") {
            return parts.next().map(|s| s.to_string());
        }
    }
    None
}

pub async fn api_key_auth(
    State(state): State<Arc<ApiKeyState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(configured) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    match extract_key(&req) {
        Some(provided) if keys_match(&provided, configured) => Ok(next.run(req).await),
        _ => Err(AuthError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_rejects_different_lengths_and_content() {
        assert!(keys_match("secret123", "secret123"));
        assert!(!keys_match("secret1", "secret123"));
        assert!(!keys_match("secretXXX", "secret123"));
    }
}
