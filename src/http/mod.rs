//! Thin HTTP surface over the Session Manager.
//!
//! This module makes the end-to-end HTTP scenarios concrete and runnable —
//! routing, bearer auth, and error-kind-to-status mapping only. No
//! validation logic lives here beyond what's needed to deserialize a body;
//! everything else is the Manager's job.

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::SandkastenError;
use crate::manager::{AcquireSource, Manager};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub api_key: String,
}

pub fn router(manager: Arc<Manager>, api_key: String) -> Router {
    let state = AppState { manager, api_key };

    let authenticated = Router::new()
        .route("/v1/sessions", get(list_sessions).post(create_session))
        .route(
            "/v1/sessions/:id",
            get(get_session).delete(destroy_session),
        )
        .route("/v1/sessions/:id/exec", post(exec_session))
        .route("/v1/sessions/:id/exec/stream", post(exec_session_stream))
        .route("/v1/sessions/:id/fs/write", post(write_file))
        .route("/v1/sessions/:id/fs/read", get(read_file))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(authenticated)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> AxumResponse {
    if state.api_key.is_empty() {
        return next.run(request).await;
    }

    let expected = format!("Bearer {}", state.api_key);
    let ok = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if ok {
        next.run(request).await
    } else {
        error_response(SandkastenError::InvalidRequest("missing or invalid bearer token".to_string()), Some(StatusCode::UNAUTHORIZED))
    }
}

fn status_for(error: &SandkastenError) -> StatusCode {
    match error {
        SandkastenError::NotFound => StatusCode::NOT_FOUND,
        SandkastenError::Expired => StatusCode::GONE,
        SandkastenError::InvalidImage(_) | SandkastenError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SandkastenError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SandkastenError::NotRunning => StatusCode::CONFLICT,
        SandkastenError::RunnerError(_) | SandkastenError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: SandkastenError, status_override: Option<StatusCode>) -> AxumResponse {
    let status = status_override.unwrap_or_else(|| status_for(&error));
    let body = json!({
        "error_code": error.code(),
        "message": error.to_string(),
    });
    (status, Json(body)).into_response()
}

fn error_response_with_details(error: SandkastenError, details: serde_json::Value) -> AxumResponse {
    let status = status_for(&error);
    let body = json!({
        "error_code": error.code(),
        "message": error.to_string(),
        "details": details,
    });
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
    #[serde(default)]
    ttl_seconds: i64,
}

#[derive(Serialize)]
struct SessionView {
    id: String,
    image: String,
    status: String,
    cwd: String,
    workspace_id: String,
    acquire_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    acquire_detail: Option<String>,
}

impl SessionView {
    fn from_record(record: crate::store::SessionRecord) -> SessionView {
        SessionView {
            id: record.id,
            image: record.image,
            status: format!("{:?}", record.status).to_lowercase(),
            cwd: record.cwd,
            workspace_id: record.workspace_id,
            acquire_source: "existing".to_string(),
            acquire_detail: None,
        }
    }

    fn from_info(info: crate::manager::SessionInfo) -> SessionView {
        let source = match info.acquire_source {
            AcquireSource::Pool => "pool",
            AcquireSource::Cold => "cold",
        };
        let mut view = SessionView::from_record(info.record);
        view.acquire_source = source.to_string();
        view.acquire_detail = info.acquire_detail;
        view
    }
}

async fn list_sessions(State(state): State<AppState>) -> AxumResponse {
    match state.manager.list() {
        Ok(rows) => Json(rows.into_iter().map(SessionView::from_record).collect::<Vec<_>>()).into_response(),
        Err(e) => error_response(e, None),
    }
}

async fn create_session(State(state): State<AppState>, Json(body): Json<CreateSessionBody>) -> AxumResponse {
    match state.manager.create(body.image, body.workspace_id, body.ttl_seconds) {
        Ok(info) => (StatusCode::CREATED, Json(SessionView::from_info(info))).into_response(),
        Err(e) => error_response(e, None),
    }
}

async fn get_session(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> AxumResponse {
    match state.manager.get(&id) {
        Ok(record) => Json(SessionView::from_record(record)).into_response(),
        Err(e) => error_response(e, None),
    }
}

async fn destroy_session(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> AxumResponse {
    match state.manager.destroy(&id) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e, None),
    }
}

#[derive(Deserialize)]
struct ExecBody {
    cmd: String,
    #[serde(default)]
    timeout_ms: i64,
    #[serde(default)]
    raw_output: bool,
}

#[derive(Serialize)]
struct ExecView {
    exit_code: i32,
    cwd: String,
    output: String,
    truncated: bool,
    duration_ms: u64,
}

async fn exec_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<ExecBody>,
) -> AxumResponse {
    let cmd_bytes = body.cmd.len();
    match state.manager.exec(&id, &body.cmd, body.timeout_ms, body.raw_output) {
        Ok(result) => Json(ExecView {
            exit_code: result.exit_code,
            cwd: result.cwd,
            output: result.output,
            truncated: result.truncated,
            duration_ms: result.duration_ms,
        })
        .into_response(),
        Err(e @ SandkastenError::InvalidRequest(_)) if cmd_bytes > crate::protocol::MAX_EXEC_INLINE_CMD_BYTES => {
            error_response_with_details(
                e,
                json!({
                    "cmd_bytes": cmd_bytes,
                    "max_cmd_bytes": crate::protocol::MAX_EXEC_INLINE_CMD_BYTES,
                    "recommendation": "command too large to send inline; use fs/write to stage it, then exec the path",
                }),
            )
        }
        Err(e) => error_response(e, None),
    }
}

async fn exec_session_stream(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<ExecBody>,
) -> Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let result = state.manager.exec(&id, &body.cmd, body.timeout_ms, body.raw_output);

    let event = match result {
        Ok(r) => Event::default().json_data(json!({
            "output": r.output,
            "exit_code": r.exit_code,
            "cwd": r.cwd,
            "duration_ms": r.duration_ms,
            "done": true,
        })),
        Err(e) => Event::default().json_data(json!({
            "error_code": e.code(),
            "message": e.to_string(),
            "done": true,
        })),
    }
    .unwrap_or_else(|_| Event::default().data("{\"done\":true}"));

    Sse::new(futures_util::stream::once(async move { Ok(event) }))
}

#[derive(Deserialize)]
struct WriteBody {
    path: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
}

async fn write_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<WriteBody>,
) -> AxumResponse {
    match state.manager.write(&id, &body.path, body.text, body.content_base64) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e, None),
    }
}

#[derive(Deserialize)]
struct ReadQuery {
    path: String,
    #[serde(default)]
    max_bytes: i64,
}

async fn read_file(State(state): State<AppState>, AxumPath(id): AxumPath<String>, Query(q): Query<ReadQuery>) -> AxumResponse {
    match state.manager.read(&id, &q.path, q.max_bytes) {
        Ok((content_base64, truncated)) => Json(json!({
            "content_base64": content_base64,
            "truncated": truncated,
        }))
        .into_response(),
        Err(e) => error_response(e, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec_table() {
        assert_eq!(status_for(&SandkastenError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&SandkastenError::Expired), StatusCode::GONE);
        assert_eq!(
            status_for(&SandkastenError::InvalidImage("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&SandkastenError::Timeout("x".into())), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&SandkastenError::RunnerError("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
