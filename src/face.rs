use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::control::RunControl;
use crate::error::ControlError;
use crate::hands::StepFailure;
use crate::types::{Action, RunEvent};

impl RunEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            RunEvent::Status { status } => Event::default()
                .event("status")
                .data(json!({ "status": status }).to_string()),
            RunEvent::Step {
                step_id,
                status,
                detail,
            } => Event::default().event("step").data(
                json!({ "stepId": step_id, "status": status, "detail": detail }).to_string(),
            ),
            RunEvent::Log { line } => Event::default()
                .event("log")
                .data(json!({ "line": line }).to_string()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub control: RunControl,
    pub snapshot_dir: PathBuf,
}

/// Build the HTTP surface: run control, run events, snapshots and the raw
/// session protocol.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/submit", post(submit_handler))
        .route("/runs", get(list_handler))
        .route("/run/{run_id}", get(run_handler))
        .route("/run/{run_id}/pause", post(pause_handler))
        .route("/run/{run_id}/resume", post(resume_handler))
        .route("/run/{run_id}/stop", post(stop_handler))
        .route("/run/{run_id}/events", get(events_handler))
        .route("/snapshots/{name}", get(snapshot_handler))
        .route("/session/open", post(session_open_handler))
        .route("/session/step", post(session_step_handler))
        .route("/session/screenshot", post(session_screenshot_handler))
        .route("/session/close", post(session_close_handler))
        .route(
            "/favicon.ico",
            get(|| async { StatusCode::NO_CONTENT }),
        ) // Silence 404
        .fallback(fallback)
        .with_state(Arc::new(state))
}

/// Bind `addr`, moving up to nine ports higher if it is taken.
pub async fn bind(addr: &str) -> anyhow::Result<tokio::net::TcpListener> {
    let addr: std::net::SocketAddr = addr.parse()?;
    let mut last_err = None;
    for offset in 0..10u16 {
        let mut candidate = addr;
        candidate.set_port(addr.port().saturating_add(offset));
        match tokio::net::TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(%candidate, error = %e, "port unavailable");
                last_err = Some(e);
            }
        }
        if addr.port() == 0 {
            break;
        }
    }
    Err(anyhow::anyhow!(
        "could not bind {addr} or the next nine ports: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

async fn fallback() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct SubmitPayload {
    #[serde(default)]
    instruction: Option<String>,
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitPayload>,
) -> Result<Json<Value>, ControlError> {
    debug!("POST /submit");
    let instruction = payload.instruction.unwrap_or_default();
    let submitted = state.control.submit(&instruction).await?;
    Ok(Json(json!(submitted)))
}

async fn list_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let runs = state.control.list().await;
    Json(json!({ "runs": runs }))
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ControlError> {
    let view = state.control.status(&run_id).await?;
    Ok(Json(json!(view)))
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ControlError> {
    debug!(%run_id, "POST pause");
    let status = state.control.pause(&run_id).await?;
    Ok(Json(json!({ "status": status })))
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ControlError> {
    debug!(%run_id, "POST resume");
    let status = state.control.resume(&run_id).await?;
    Ok(Json(json!({ "status": status })))
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ControlError> {
    debug!(%run_id, "POST stop");
    let status = state.control.stop(&run_id).await?;
    Ok(Json(json!({ "status": status })))
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ControlError> {
    let rx = state.control.subscribe(&run_id).await?;
    let stream = BroadcastStream::new(rx).filter_map(|result: Result<RunEvent, _>| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    if !is_snapshot_name(&name) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid snapshot name" })))
            .into_response();
    }
    match tokio::fs::read(state.snapshot_dir.join(&name)).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("snapshot not found: {name}") })),
        )
            .into_response(),
    }
}

fn is_snapshot_name(name: &str) -> bool {
    name.ends_with(".png")
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ---------------------------------------------------------------------------
// Session protocol
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Reply<T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

fn ok_reply<T: Serialize>(body: T) -> Json<Value> {
    Json(json!(Reply { ok: true, body }))
}

fn error_reply(error: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "ok": false, "error": error.to_string() }))
}

#[derive(Deserialize, Default)]
struct OpenPayload {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepPayload {
    session_id: String,
    action: String,
    #[serde(default)]
    arguments: Value,
}

async fn session_open_handler(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Json<Value> {
    // An empty body means "no initial location".
    let payload: OpenPayload = if body.is_empty() {
        OpenPayload::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => return error_reply(format!("invalid open request: {e}")),
        }
    };
    match state
        .control
        .sessions()
        .open(payload.location.as_deref())
        .await
    {
        Ok(opened) => ok_reply(opened),
        Err(e) => error_reply(e),
    }
}

async fn session_step_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StepPayload>,
) -> Json<Value> {
    let action = match Action::from_parts(&payload.action, payload.arguments) {
        Ok(action) => action,
        Err(e) => return error_reply(e),
    };
    match state
        .control
        .sessions()
        .step(&payload.session_id, &action)
        .await
    {
        Ok(frame) => ok_reply(frame),
        Err(StepFailure { error, frame }) => {
            let mut reply = json!({ "ok": false, "error": error.to_string() });
            if let (Some(frame), Some(obj)) = (frame, reply.as_object_mut()) {
                obj.insert("snapshotRef".into(), json!(frame.snapshot));
                obj.insert("currentLocation".into(), json!(frame.location));
            }
            Json(reply)
        }
    }
}

async fn session_screenshot_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SessionPayload>,
) -> Json<Value> {
    match state
        .control
        .sessions()
        .screenshot(&payload.session_id)
        .await
    {
        Ok(frame) => ok_reply(frame),
        Err(e) => error_reply(e),
    }
}

async fn session_close_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SessionPayload>,
) -> Json<Value> {
    let closed = state.control.sessions().close(&payload.session_id).await;
    ok_reply(json!({ "closed": closed }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_cannot_escape_the_directory() {
        assert!(is_snapshot_name("sess-0a1b2c-3.png"));
        assert!(!is_snapshot_name("../secret.png"));
        assert!(!is_snapshot_name("a/b.png"));
        assert!(!is_snapshot_name("sess-1.txt"));
    }
}
