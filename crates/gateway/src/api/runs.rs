//! Run API handlers.

use axum::extract::{Multipart, Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;
use uuid::Uuid;

use relay_domain::error::Error;
use relay_domain::event::RunEvent;
use relay_domain::run::RunStatus;

use crate::runtime::{AgentRunRequest, Attachment};
use crate::state::AppState;

use super::error_response;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /agent/runs (multipart)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `request` part carries the [`AgentRunRequest`] JSON; every `files`
/// part becomes an attachment uploaded into the sandbox workspace.
pub async fn create_run(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    let mut request: Option<AgentRunRequest> = None;
    let mut attachments: Vec<Attachment> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(Error::InvalidRequest(format!("malformed multipart body: {e}")));
            }
        };

        let part_name = field.name().map(str::to_owned);
        match part_name.as_deref() {
            Some("request") => {
                let raw = match field.text().await {
                    Ok(raw) => raw,
                    Err(e) => {
                        return error_response(Error::InvalidRequest(format!("reading request part: {e}")));
                    }
                };
                request = match serde_json::from_str(&raw) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        return error_response(Error::InvalidRequest(format!("invalid request JSON: {e}")));
                    }
                };
            }
            Some("files") => {
                let filename = field
                    .file_name()
                    .map(sanitize_filename)
                    .unwrap_or_else(|| "attachment".into());
                let bytes = match field.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return error_response(Error::InvalidRequest(format!("reading file part: {e}")));
                    }
                };
                attachments.push(Attachment { filename, bytes: bytes.to_vec() });
            }
            _ => {}
        }
    }

    let Some(request) = request else {
        return error_response(Error::InvalidRequest("missing multipart part: request".into()));
    };

    match state.manager.start_run(request, attachments).await {
        Ok(run) => Json(serde_json::json!({
            "run_id": run.run_id,
            "thread_id": run.thread_id,
            "status": run.status,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Strip any path components from an uploaded filename.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let base = base.trim();
    if base.is_empty() || base == "." || base == ".." {
        "attachment".into()
    } else {
        base.to_owned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /agent/runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_runs(State(state): State<AppState>, Query(q): Query<ListRunsQuery>) -> impl IntoResponse {
    let status = q.status.as_deref().and_then(parse_status);
    let limit = q.limit.min(200);
    let (runs, total) = state.manager.list(status, limit, q.offset);

    let items: Vec<serde_json::Value> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "run_id": r.run_id,
                "thread_id": r.thread_id,
                "project_id": r.project_id,
                "status": r.status,
                "error": r.error,
                "started_at": r.started_at,
                "ended_at": r.ended_at,
            })
        })
        .collect();

    Json(serde_json::json!({
        "runs": items,
        "total": total,
        "limit": limit,
        "offset": q.offset,
    }))
}

fn parse_status(s: &str) -> Option<RunStatus> {
    serde_json::from_value(serde_json::json!(s.to_uppercase())).ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /agent/runs/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> impl IntoResponse {
    match state.manager.status(run_id) {
        Ok(view) => Json(serde_json::json!({
            "run_id": view.run_id,
            "status": view.status,
            "thread_id": view.thread_id,
            "error": view.error,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /agent/runs/:id/stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stop_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> impl IntoResponse {
    match state.manager.stop(run_id) {
        Ok(status) => Json(serde_json::json!({
            "run_id": run_id,
            "status": status,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /agent/runs/:id/stream (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stream_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> impl IntoResponse {
    let subscription = match state.manager.subscribe(run_id) {
        Ok(subscription) => subscription,
        Err(e) => return error_response(e),
    };

    Sse::new(make_event_stream(subscription))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn make_event_stream(
    subscription: crate::runtime::fabric::Subscription,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let crate::runtime::fabric::Subscription { replay, live } = subscription;

        let mut done = false;
        for event in replay {
            let is_done = event.is_done();
            yield Ok(to_sse_event(&event));
            if is_done {
                done = true;
                break;
            }
        }

        if done {
            return;
        }

        let Some(mut rx) = live else { return };
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let is_done = event.is_done();
                    yield Ok(to_sse_event(&event));
                    if is_done {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    let msg = format!("{{\"warning\":\"missed {n} events\"}}");
                    yield Ok(Event::default().event("warning").data(msg));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn to_sse_event(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.kind.as_str()).data(data)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /agent/health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
    }))
}
