use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TaskStatus;

/// A single in-flight or completed execution of a package. Rows of this
/// shape are owned by the task repository (C2); everything else treats
/// `Task` as the unit of state for one execution.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub deployment_id: String,
    pub package_name: String,
    pub package_version: String,
    pub stage: String,
    pub status: TaskStatus,
    pub pod_name: String,
    pub namespace: String,
    pub hostname: String,
    pub ip_address: String,
    pub pid: Option<i32>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_ui_app: bool,
    pub ui_ip_address: Option<String>,
    pub ui_port: Option<u16>,
    /// First UI port ever observed for this task. Written once; later
    /// re-matches update `ui_port` but never this field.
    pub original_ui_port: Option<u16>,
    pub vscode_port: Option<u16>,
    pub arguments: Vec<TaskArgument>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TaskArgument {
    pub name: String,
    pub value: serde_json::Value,
}

/// Read-time projection of a `Task` for API responses: adds a human
/// `message` field and the task's current resource metrics, neither of
/// which belong on the persisted row.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub task_id: String,
    pub package_name: String,
    pub package_version: String,
    pub status: TaskStatus,
    pub stage: String,
    pub hostname: String,
    pub ip_address: String,
    pub pid: Option<i32>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub is_ui_app: bool,
    pub ui_port: Option<u16>,
    pub original_ui_port: Option<u16>,
    pub vscode_port: Option<u16>,
    pub metrics: Option<PodMetrics>,
}

impl TaskInfo {
    pub fn from_task(task: &Task, metrics: Option<PodMetrics>) -> Self {
        let message = if task.status.is_terminal() {
            if task.result.is_some() {
                Some("Result available".to_string())
            } else {
                task.error.clone()
            }
        } else {
            Some(format!("Task is {}", task.status))
        };
        TaskInfo {
            task_id: task.task_id.clone(),
            package_name: task.package_name.clone(),
            package_version: task.package_version.clone(),
            status: task.status,
            stage: task.stage.clone(),
            hostname: task.hostname.clone(),
            ip_address: task.ip_address.clone(),
            pid: task.pid,
            message,
            started_at: task.started_at,
            finished_at: task.finished_at,
            is_ui_app: task.is_ui_app,
            ui_port: task.ui_port,
            original_ui_port: task.original_ui_port,
            vscode_port: task.vscode_port,
            metrics,
        }
    }
}

/// Snapshot of a pod's current CPU/memory usage, parsed from the cluster's
/// metrics API into human-readable units.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PodMetrics {
    /// e.g. "0.25" cores
    pub cpu: String,
    /// e.g. "512.00 MB"
    pub memory: String,
}

/// Body of `POST /execute/` and the query-parameter-derived equivalent of
/// the GET routes.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub package_name: String,
    pub version: Option<String>,
    pub stage: String,
    #[serde(default)]
    pub arguments: Vec<TaskArgument>,
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub redirect_to_ui: bool,
}

fn default_true() -> bool {
    true
}

/// Renders a terminal task's `result` as the `output` string of a sync
/// execution response. `Value::Null` — what a successful run with nothing
/// to return stores (§OBSERVE completes with `serde_json::Value::Null`) —
/// renders as `""`, not the literal `"null"` a bare `.to_string()` would
/// produce; any other value renders as its JSON text.
pub fn render_output(result: Option<serde_json::Value>) -> String {
    match result {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(v) => v.to_string(),
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SyncExecutionResponse {
    pub success: bool,
    pub output: String,
    pub task_id: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct AsyncExecutionResponse {
    pub task_id: String,
    pub message: String,
    pub status: TaskStatus,
}
