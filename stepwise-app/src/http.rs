use crate::state::AppState;
use crate::transport::ndjson_response;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;
use stepwise_runtime::{AdmissionError, Identity, LaneTarget, Run, RunRequest};

/// Header carrying the caller id, set by the upstream auth proxy.
pub const IDENTITY_HEADER: &str = "x-stepwise-user";

pub const HEALTH_PATH: &str = "/health";
pub const BUILDER_RUNS_PATH: &str = "/builder/runs";
pub const ASSISTANT_RUNS_PATH: &str = "/assistant/runs";
pub const AGENT_EXECUTE_PATH: &str = "/agents/:id/execute";
pub const WORKFLOW_RUNS_PATH: &str = "/workflows/:id/runs";
pub const RUN_PATH: &str = "/runs/:id";
pub const SESSION_RUNS_PATH: &str = "/sessions/:id/runs";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Admission(e) => (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.code(),
            ),
            ApiError::RunNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::warn!(code, error = %self, "Request failed");
        }
        let body = Json(json!({ "code": code, "message": self.to_string() }));
        (status, body).into_response()
    }
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health))
}

/// One POST route per lane; each answers with an NDJSON event stream.
pub fn lane_routes() -> Router<AppState> {
    Router::new()
        .route(BUILDER_RUNS_PATH, post(start_builder))
        .route(ASSISTANT_RUNS_PATH, post(start_assistant))
        .route(AGENT_EXECUTE_PATH, post(execute_agent))
        .route(WORKFLOW_RUNS_PATH, post(start_workflow))
}

pub fn history_routes() -> Router<AppState> {
    Router::new()
        .route(RUN_PATH, get(get_run))
        .route(SESSION_RUNS_PATH, get(list_session_runs))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(lane_routes())
        .merge(history_routes())
        .with_state(state)
}

async fn health(State(st): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "availableRunSlots": st.entry.available_permits(),
    }))
}

async fn start_builder(
    State(st): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    start_run(&st, LaneTarget::Builder, &headers, &body).await
}

async fn start_assistant(
    State(st): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    start_run(&st, LaneTarget::Assistant, &headers, &body).await
}

async fn execute_agent(
    State(st): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    start_run(&st, LaneTarget::PublicAgent(id), &headers, &body).await
}

async fn start_workflow(
    State(st): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    start_run(&st, LaneTarget::Workflow(id), &headers, &body).await
}

async fn start_run(
    st: &AppState,
    target: LaneTarget,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    let request = parse_request(body)?;
    let handle = st.entry.start(target, identity(headers), request).await?;
    Ok(ndjson_response(handle))
}

async fn get_run(
    State(st): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Run>, ApiError> {
    let caller = identity(&headers);
    if !is_plain_id(&id) {
        return Err(ApiError::RunNotFound(id));
    }

    let run = st
        .entry
        .recorder()
        .load(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    match run {
        Some(run) if visible_to(&run, &caller) => Ok(Json(run)),
        _ => Err(ApiError::RunNotFound(id)),
    }
}

async fn list_session_runs(
    State(st): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Run>>, ApiError> {
    let caller = identity(&headers);
    let Some(user_id) = caller.user_id() else {
        return Err(AdmissionError::Unauthenticated.into());
    };

    let runs = st
        .entry
        .recorder()
        .list_for_session(&id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(
        runs.into_iter()
            .filter(|run| run.owner.as_deref() == Some(user_id))
            .collect(),
    ))
}

pub fn identity(headers: &HeaderMap) -> Identity {
    Identity::from_header(
        headers
            .get(IDENTITY_HEADER)
            .and_then(|value| value.to_str().ok()),
    )
}

fn parse_request(body: &[u8]) -> Result<RunRequest, AdmissionError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AdmissionError::InvalidRequest("empty body".to_string()));
    }
    serde_json::from_slice(body)
        .map_err(|e| AdmissionError::InvalidRequest(format!("malformed body: {}", e)))
}

/// Guest runs are readable by anyone holding the id; user runs only by
/// their owner.
fn visible_to(run: &Run, caller: &Identity) -> bool {
    match &run.owner {
        None => true,
        Some(owner) => caller.user_id() == Some(owner.as_str()),
    }
}

fn is_plain_id(id: &str) -> bool {
    !id.is_empty() && !id.contains("..") && !id.contains('/') && !id.contains('\\')
}
