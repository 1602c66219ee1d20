//! API authentication middleware.
//!
//! The bearer token (`RELAY_API_TOKEN`) is read once at startup and only
//! its SHA-256 digest is kept in state. When no token is configured the
//! server logs a warning once and allows unauthenticated access (dev
//! mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Compute the stored digest for a configured token.
pub fn token_hash(token: Option<&str>) -> Option<Vec<u8>> {
    match token {
        Some(t) if !t.trim().is_empty() => Some(Sha256::digest(t.as_bytes()).to_vec()),
        _ => {
            tracing::warn!("RELAY_API_TOKEN not set; /agent routes are unauthenticated");
            None
        }
    }
}

/// Axum middleware enforcing `Authorization: Bearer <token>` on protected
/// routes. Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match &state.api_token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    // Hash the provided token to a fixed-length digest, then compare in
    // constant time so the comparison leaks neither content nor length.
    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API token" })),
        )
            .into_response();
    }

    next.run(req).await
}
