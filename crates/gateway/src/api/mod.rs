//! HTTP API surface.
//!
//! - `POST /agent/runs`               — start a run (multipart)
//! - `GET  /agent/runs`               — list recent runs
//! - `GET  /agent/runs/:id`           — run status
//! - `POST /agent/runs/:id/stop`      — cooperative stop
//! - `GET  /agent/runs/:id/stream`    — SSE event stream (replay + live)
//! - `GET  /agent/health`             — liveness probe (unauthenticated)

pub mod auth;
pub mod runs;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/agent/runs", post(runs::create_run).get(runs::list_runs))
        .route("/agent/runs/:run_id", get(runs::get_run))
        .route("/agent/runs/:run_id/stop", post(runs::stop_run))
        .route("/agent/runs/:run_id/stream", get(runs::stream_run))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_api_token));

    Router::new()
        .route("/agent/health", get(runs::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a domain error onto the HTTP status + JSON body contract.
pub(crate) fn error_response(err: relay_domain::Error) -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use relay_domain::Error;

    let status = match &err {
        Error::InvalidRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::AdmissionTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        axum::Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
