use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use lotse_common::Error;
use lotse_types::{AsyncExecutionResponse, SyncExecutionResponse, TaskInfo, TaskStatus};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn status(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Response, ApiError> {
    let task = state.repository.get_task(&task_id).await?.ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
    if task.status.is_terminal() {
        let success = task.status == TaskStatus::Completed;
        let output = lotse_types::render_output(task.result);
        Ok(Json(SyncExecutionResponse { success, output, task_id, error: task.error.unwrap_or_default() }).into_response())
    } else {
        let metrics = state.engine.orchestrator.read_metrics(&task.namespace, &task.pod_name).await.ok().flatten();
        Ok(Json(TaskInfo::from_task(&task, metrics)).into_response())
    }
}

pub async fn delete(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Response, ApiError> {
    let task = state.repository.get_task(&task_id).await?.ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
    if !task.status.is_terminal() {
        return Err(Error::BadState(format!("task {} is still {}", task_id, task.status)).into());
    }
    state.repository.delete_task(&task_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Cancellation may need to cross replicas: a task's worker only lives on
/// the replica that launched it, identified by `task.ip_address`. If that
/// isn't us, hop over HTTP to the owning replica's own cancel route,
/// falling back to a local (no-op) cancel if the hop fails — mirroring
/// `task.py`'s `cancel_task` route.
pub async fn cancel(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Response, ApiError> {
    let task = state.repository.get_task(&task_id).await?.ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
    if task.status.is_terminal() {
        return Err(Error::BadState(format!("task {} is already {}", task_id, task.status)).into());
    }

    if task.ip_address == state.engine.ip_address || task.ip_address.is_empty() {
        return match state.engine.cancel(&task_id).await? {
            true => Ok(Json(AsyncExecutionResponse { task_id, message: "Cancellation requested".to_owned(), status: TaskStatus::Cancelled }).into_response()),
            false => Err(Error::BadState("task is not running on this replica".to_owned()).into()),
        };
    }

    let url = format!("http://{}:{}/task/{}/cancel", task.ip_address, state.control_port, task_id);
    match state.http.post(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            Ok(Json(AsyncExecutionResponse { task_id, message: "Cancellation requested".to_owned(), status: TaskStatus::Cancelled }).into_response())
        }
        _ => {
            state.engine.cancel(&task_id).await?;
            Ok(
                Json(AsyncExecutionResponse { task_id, message: "Cancellation requested locally after remote hop failed".to_owned(), status: TaskStatus::Cancelled })
                    .into_response(),
            )
        }
    }
}

pub async fn list_by_stage(State(state): State<AppState>, Path(stage): Path<String>) -> Result<Response, ApiError> {
    let tasks = state.repository.list_tasks(&stage).await?;
    Ok(Json(tasks.into_iter().map(|t| TaskInfo::from_task(&t, None)).collect::<Vec<_>>()).into_response())
}

/// Reads the task's own file-backed log, newest line first. Grounded on
/// `task.py`'s `GET /task/{id}/logs` and `TaskLogger.get_logs`: this is the
/// engine's own per-task-id log file (phase transitions, final status),
/// not the pod's container logs, which is what the engine itself reads
/// when scanning for a UI port during OBSERVE.
pub async fn logs(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Response, ApiError> {
    state.repository.get_task(&task_id).await?.ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
    Ok(Json(lotse_common::task_logger::read_reversed(&task_id).await).into_response())
}

pub async fn install_ssh(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let engine = state.engine.clone();
    state.engine.queue.enqueue(async move {
        if let Err(e) = lotse_engine::engine::install_ssh_server(&engine, &task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "ssh sidecar install failed");
        }
    });
    StatusCode::ACCEPTED.into_response()
}

pub async fn run_vscode_server(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let engine = state.engine.clone();
    state.engine.queue.enqueue(async move {
        if let Err(e) = lotse_engine::engine::install_and_run_vscode_server(&engine, &task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "vscode sidecar install failed");
        }
    });
    StatusCode::ACCEPTED.into_response()
}
