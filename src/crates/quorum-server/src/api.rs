//! axum HTTP API (§6 "HTTP/SSE"). Handler shapes follow
//! `orchestrator::api::handlers::realtime`'s `State<Arc<T>>` extractor
//! idiom; routing/middleware setup follows `orchestrator-server.rs`'s
//! binary composition.

use crate::config::QuorumConfig;
use crate::runner_builder::RunnerStack;
use crate::sse::sse_handler;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use quorum_core::{CoreError, ErrorCode};
use quorum_state::{ConflictOption, ExecutionMode, StateManager, TaskId, WorkflowId, WorkflowState};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

pub struct AppState {
    pub config: QuorumConfig,
    pub stack: RunnerStack,
    pub running: tokio::sync::Mutex<HashMap<WorkflowId, CancellationToken>>,
    seq: std::sync::atomic::AtomicU64,
}

impl AppState {
    pub fn new(config: QuorumConfig, stack: RunnerStack) -> Self {
        Self { config, stack, running: tokio::sync::Mutex::new(HashMap::new()), seq: std::sync::atomic::AtomicU64::new(1) }
    }

    fn next_workflow_id(&self) -> WorkflowId {
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        WorkflowId::generate(seq)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/workflows", post(start_workflow).get(list_workflows))
        .route("/api/v1/workflows/:id", get(get_workflow))
        .route("/api/v1/workflows/:id/resume", post(resume_workflow))
        .route("/api/v1/workflows/:id/cancel", post(cancel_workflow))
        .route("/api/v1/workflows/:id/tasks/:task_id/retry-merge", post(retry_merge))
        .route("/api/v1/sse/events", get(sse_handler).with_state(state.stack.bus.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            ErrorCode::Config => StatusCode::BAD_REQUEST,
            ErrorCode::AgentNotFound | ErrorCode::AgentNoAgents => StatusCode::NOT_FOUND,
            ErrorCode::LockBusy => StatusCode::CONFLICT,
            ErrorCode::CostLimit => StatusCode::PAYMENT_REQUIRED,
            ErrorCode::ConsensusAborted => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Cancelled => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(code = ?self.0.code, message = %self.0.message, "api request failed");
        (status, Json(json!({ "error_code": format!("{:?}", self.0.code), "message": self.0.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct StartWorkflowRequest {
    prompt: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartWorkflowResponse {
    workflow_id: String,
}

fn parse_execution_mode(mode: Option<&str>) -> ExecutionMode {
    match mode {
        Some("multi") | Some("multi_agent") => ExecutionMode::MultiAgent,
        Some("interactive") => ExecutionMode::Interactive,
        _ => ExecutionMode::SingleAgent,
    }
}

async fn start_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartWorkflowRequest>,
) -> Result<(StatusCode, Json<StartWorkflowResponse>), ApiError> {
    let mode = parse_execution_mode(request.mode.as_deref());
    let blueprint = crate::runner_builder::build_blueprint(&state.config, mode, &state.stack.registry)?;
    let workflow_id = state.next_workflow_id();
    let workflow_state = WorkflowState::new(workflow_id.clone(), request.prompt, blueprint);

    let cancel = CancellationToken::new();
    state.running.lock().await.insert(workflow_id.clone(), cancel.clone());

    let runner = state.stack.runner.clone();
    let running = workflow_id.clone();
    let app_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.start(workflow_state, &cancel).await {
            error!(workflow_id = %running, error = %e, "workflow run ended in error");
        }
        app_state.running.lock().await.remove(&running);
    });

    Ok((StatusCode::ACCEPTED, Json(StartWorkflowResponse { workflow_id: workflow_id.0 })))
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let cancel = CancellationToken::new();
    let workflows = state.stack.state_manager.list_workflows(&cancel).await?;
    let body: Vec<_> = workflows
        .into_iter()
        .map(|w| json!({ "workflow_id": w.workflow_id.0, "status": w.status, "updated_at": w.updated_at, "heartbeat_at": w.heartbeat_at }))
        .collect();
    Ok(Json(json!({ "workflows": body })))
}

async fn get_workflow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<WorkflowState>, ApiError> {
    let cancel = CancellationToken::new();
    let workflow_state = state
        .stack
        .state_manager
        .load(&WorkflowId(id.clone()), &cancel)
        .await?
        .ok_or_else(|| CoreError::new(ErrorCode::Internal, format!("unknown workflow {id}")))?;
    Ok(Json(workflow_state))
}

async fn resume_workflow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let cancel = CancellationToken::new();
    let workflow_id = WorkflowId(id.clone());
    let workflow_state = state
        .stack
        .state_manager
        .load(&workflow_id, &cancel)
        .await?
        .ok_or_else(|| CoreError::new(ErrorCode::Internal, format!("unknown workflow {id}")))?;

    let run_cancel = CancellationToken::new();
    state.running.lock().await.insert(workflow_id.clone(), run_cancel.clone());

    let runner = state.stack.runner.clone();
    let app_state = state.clone();
    let running_id = workflow_id.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.resume_with_state(workflow_state, &run_cancel).await {
            error!(workflow_id = %running_id, error = %e, "resumed workflow ended in error");
        }
        app_state.running.lock().await.remove(&running_id);
    });

    Ok(StatusCode::ACCEPTED)
}

async fn cancel_workflow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> StatusCode {
    let workflow_id = WorkflowId(id);
    if let Some(token) = state.running.lock().await.get(&workflow_id) {
        token.cancel();
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct RetryMergeRequest {
    conflict_option: String,
}

/// §8 S6: "a subsequent `retry-merge` call with `conflictOption=theirs`
/// clears the flag."
async fn retry_merge(
    State(state): State<Arc<AppState>>,
    Path((id, task_id)): Path<(String, String)>,
    Json(request): Json<RetryMergeRequest>,
) -> Result<StatusCode, ApiError> {
    let cancel = CancellationToken::new();
    let workflow_id = WorkflowId(id.clone());
    let mut workflow_state = state
        .stack
        .state_manager
        .load(&workflow_id, &cancel)
        .await?
        .ok_or_else(|| CoreError::new(ErrorCode::Internal, format!("unknown workflow {id}")))?;

    let task_id = TaskId(task_id);
    let task = workflow_state
        .tasks
        .get(&task_id)
        .cloned()
        .ok_or_else(|| CoreError::new(ErrorCode::Internal, format!("unknown task {task_id}")))?;

    if !task.merge_pending {
        return Err(CoreError::new(ErrorCode::Config, "task has no merge pending").into());
    }
    let branch = task.branch.clone().ok_or_else(|| CoreError::new(ErrorCode::Internal, "merge-pending task has no branch"))?;

    let conflict = match request.conflict_option.as_str() {
        "theirs" => ConflictOption::Theirs,
        "ours" => ConflictOption::Ours,
        other => return Err(CoreError::new(ErrorCode::Config, format!("unknown conflict_option '{other}'")).into()),
    };

    let outcome = {
        let git = state.stack.git.lock().await;
        git.merge_task_to_workflow(&workflow_id, &branch, workflow_state.merge_strategy, Some(conflict))?
    };

    if outcome.is_none() {
        if let Some(task) = workflow_state.tasks.get_mut(&task_id) {
            task.merge_pending = false;
        }
        state.stack.state_manager.save(&workflow_state, &cancel).await?;
        Ok(StatusCode::OK)
    } else {
        Err(CoreError::new(ErrorCode::Git, "merge still has unresolved conflicts").into())
    }
}
