use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use lotse_common::Error;
use lotse_types::{AsyncExecutionResponse, ExecutionRequest, SyncExecutionResponse, TaskArgument, TaskStatus};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ApiError;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REDIRECT_TO_UI_BUDGET: Duration = Duration::from_secs(30);

pub async fn execute(State(state): State<AppState>, Json(req): Json<ExecutionRequest>) -> Result<Response, ApiError> {
    run_execution(state, req).await
}

pub async fn execute_empty_instance(State(state): State<AppState>, Json(mut req): Json<ExecutionRequest>) -> Result<Response, ApiError> {
    req.wait_for_completion = false;
    run_execution_with_flags(state, req, true).await
}

pub async fn execute_default_stage(
    State(state): State<AppState>,
    Path((package_name, stage)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    run_execution(state, request_from_query(package_name, None, stage, query)).await
}

pub async fn execute_versioned(
    State(state): State<AppState>,
    Path((package_name, version, stage)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    run_execution(state, request_from_query(package_name, Some(version), stage, query)).await
}

fn request_from_query(package_name: String, version: Option<String>, stage: String, mut query: HashMap<String, String>) -> ExecutionRequest {
    let wait_for_completion = query.remove("wait_for_completion").map(|v| v != "false").unwrap_or(true);
    let redirect_to_ui = query.remove("redirect_to_ui").map(|v| v == "true").unwrap_or(false);
    let arguments = query
        .into_iter()
        .map(|(name, value)| TaskArgument { name, value: serde_json::Value::String(value) })
        .collect();
    ExecutionRequest { package_name, version, stage, arguments, wait_for_completion, redirect_to_ui }
}

async fn run_execution(state: AppState, req: ExecutionRequest) -> Result<Response, ApiError> {
    run_execution_with_flags(state, req, false).await
}

/// Launches an execution from the broker ingress: no HTTP response to
/// produce, so this just resolves the package and hands off to the
/// engine, logging (never propagating) any failure. Mirrors
/// `PackageExecutionListenerService.on_message`'s fire-and-forget
/// handoff to `execute_package_async`.
pub async fn enqueue_async(state: &AppState, req: ExecutionRequest) {
    let package = match state.packages.resolve(&req.package_name, req.version.as_deref(), &req.stage).await {
        Ok(Some(package)) => package,
        Ok(None) => {
            tracing::warn!(package = %req.package_name, stage = %req.stage, "broker message referenced an unknown package");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to resolve package for broker message");
            return;
        }
    };
    let deployment_id = package.deployment_id.clone();
    if let Err(e) = state.engine.start(package, deployment_id, req.arguments, false).await {
        tracing::error!(error = %e, "failed to start task from broker message");
    }
}

async fn run_execution_with_flags(state: AppState, req: ExecutionRequest, empty_instance: bool) -> Result<Response, ApiError> {
    if req.package_name.trim().is_empty() {
        return Err(Error::UserInputError("package_name must not be empty".to_owned()).into());
    }
    if req.stage.trim().is_empty() {
        return Err(Error::UserInputError("stage must not be empty".to_owned()).into());
    }
    let package = state
        .packages
        .resolve(&req.package_name, req.version.as_deref(), &req.stage)
        .await?
        .ok_or_else(|| Error::PackageNotFound(format!("{} ({})", req.package_name, req.stage)))?;
    let deployment_id = package.deployment_id.clone();

    let task_id = state.engine.start(package, deployment_id, req.arguments, empty_instance).await?;

    if req.redirect_to_ui {
        let deadline = tokio::time::Instant::now() + REDIRECT_TO_UI_BUDGET;
        loop {
            if let Ok(Some(task)) = state.repository.get_task(&task_id).await {
                if task.ui_port.is_some() {
                    return Ok(Redirect::to(&format!("{}/proxy/{}", state.openapi_prefix_path, task_id)).into_response());
                }
                if task.status.is_terminal() {
                    break;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    if !req.wait_for_completion {
        return Ok(Json(AsyncExecutionResponse { task_id, message: "Task started".to_owned(), status: TaskStatus::Initializing }).into_response());
    }

    loop {
        match state.repository.get_task(&task_id).await? {
            Some(task) if task.status.is_terminal() => {
                let success = task.status == TaskStatus::Completed;
                let output = lotse_types::render_output(task.result);
                return Ok(Json(SyncExecutionResponse {
                    success,
                    output,
                    task_id,
                    error: task.error.unwrap_or_default(),
                })
                .into_response());
            }
            _ => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}
