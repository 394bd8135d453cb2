use lotse_common::args::format_command_args;
use lotse_common::pod::{base_env, task_pod};
use lotse_common::Error;
use lotse_types::{Package, Runtime, Task, TaskStatus};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::ExecutionEngine;

/// Matches an address:port pair in a log line, the same shape the
/// original's `match_port` looks for — IPv4 or bracketed IPv6 followed by
/// `:port` — so a package that prints `Listening on 0.0.0.0:8080` (or any
/// other host) is recognized as a UI app. Unlike the original's regex, the
/// bracketed alternative accepts any run of hex digits and colons rather
/// than requiring all eight hextets spelled out, so compressed forms like
/// `[::1]` match too.
fn port_regex() -> Regex {
    Regex::new(r"((?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-fA-F:]+\]|(?:[0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}):(\d+)")
        .expect("valid regex")
}

/// Matches the literal trailing line a launch command is wrapped to
/// produce, since the pod's primary container never exits on its own
/// (it's `sleep infinity`) and so has no container exit code to observe.
fn exit_code_regex() -> Regex {
    Regex::new(r"^EXIT_CODE=(\d+)$").expect("valid regex")
}

/// Writes a phase transition both to the process-wide `tracing` subscriber
/// and the task's own file-backed log (`GET /task/{id}/logs`'s source),
/// mirroring how the original logged through `TaskLogger.setup_logger`
/// rather than the application-wide logger for anything task-scoped.
fn log_phase(engine: &Arc<ExecutionEngine>, task_id: &str, phase: super::Phase) {
    tracing::info!(task_id = %task_id, phase = %phase, "task phase");
    if let Err(e) = engine.task_logger.log(task_id, "INFO", &format!("phase: {}", phase)) {
        tracing::warn!(task_id = %task_id, error = %e, "failed to write task log file");
    }
}

pub enum WorkerOutcome {
    Completed(serde_json::Value),
    Failed(String),
    TimedOut,
}

/// Drives one task through PREPARE, LAUNCH, and OBSERVE. TERMINATE is
/// handled by [`finalize`], since it must run even when this future is
/// cancelled by the timeout race in `ExecutionEngine::start`.
pub async fn run(
    engine: Arc<ExecutionEngine>,
    task: Task,
    package: Package,
    empty_instance: bool,
    cancelled: Arc<AtomicBool>,
) -> Result<WorkerOutcome, Error> {
    log_phase(&engine, &task.task_id, super::Phase::Prepare);
    let preparer = engine.preparer_for(package.runtime);
    preparer.prepare_cache(&task.namespace, &package).await?;

    log_phase(&engine, &task.task_id, super::Phase::Launch);
    let env = base_env(&task.pod_name, &engine.config.openapi_prefix_path);
    let pod = task_pod(
        task.pod_name.clone(),
        task.namespace.clone(),
        package.image.clone(),
        package.runtime,
        env,
        &[],
        empty_instance,
    );
    engine.orchestrator.create_pod(&task.namespace, pod).await?;
    engine.orchestrator.wait_for_running(&task.namespace, &task.pod_name, engine.config.pod_scheduling_timeout).await?;
    engine.repository.update_status(&task.task_id, TaskStatus::Running, None, None).await?;

    log_phase(&engine, &task.task_id, super::Phase::Observe);
    if empty_instance || package.runtime == Runtime::PrebuiltContainer {
        // An empty instance has no launch command to exec regardless of the
        // package's own runtime: the pod was created with the idle
        // placeholder command (`needs_placeholder_command() || empty_instance`
        // in `task_pod`), so observation just watches the pod stay up until
        // it's cancelled, deleted, or (for a genuine container runtime
        // that isn't an empty instance) its own entrypoint exits.
        watch_container_runtime(&engine, &task, cancelled).await
    } else {
        let pre_start_command = preparer.hydrate_pod(&task.namespace, &task.pod_name, &package).await?;
        let args = format_command_args(&task.arguments);
        let command = if args.is_empty() {
            format!("cd /app && {}", pre_start_command)
        } else {
            format!("cd /app && {} {}", pre_start_command, args)
        };
        run_interpreted_or_binary(&engine, &task, &command, cancelled).await
    }
}

/// Observation loop for container-native packages: poll readiness, scan
/// the logs once for a UI port, sleep, repeat until the pod's containers
/// disappear. Grounded on `watch_pod` in `pod_api_wrapper.py`.
async fn watch_container_runtime(engine: &Arc<ExecutionEngine>, task: &Task, cancelled: Arc<AtomicBool>) -> Result<WorkerOutcome, Error> {
    let re = port_regex();
    let mut port_matched = false;
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Ok(WorkerOutcome::Failed("cancelled".to_owned()));
        }
        if !engine.orchestrator.containers_ready(&task.namespace, &task.pod_name).await? {
            if let Some(reason) = engine.orchestrator.pod_failure_reason(&task.namespace, &task.pod_name).await? {
                return Err(Error::PodFailed(reason));
            }
            return Ok(WorkerOutcome::Completed(serde_json::Value::Null));
        }
        if !port_matched {
            let logs = engine.orchestrator.read_logs(&task.namespace, &task.pod_name, Some(200)).await.unwrap_or_default();
            if let Some(captures) = re.captures(&logs) {
                if let Some(port) = captures.get(2).and_then(|m| m.as_str().parse().ok()) {
                    register_ui_port(engine, task, port).await;
                    port_matched = true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Observation for interpreted/native-binary packages: exec the launch
/// command wrapped so its exit status is echoed as a literal trailing
/// `EXIT_CODE=<n>` line (`start_app`'s convention — the pod's primary
/// container never exits on its own), with a line callback that scans for
/// a UI port exactly as `start_app`'s `line_callback` does, and returns
/// the captured code once the marker is seen.
async fn run_interpreted_or_binary(engine: &Arc<ExecutionEngine>, task: &Task, command: &str, cancelled: Arc<AtomicBool>) -> Result<WorkerOutcome, Error> {
    let port_re = port_regex();
    let exit_re = exit_code_regex();
    let shell = engine.orchestrator.shell_probe(&task.namespace, &task.pod_name).await?;
    let task_id = task.task_id.clone();
    let namespace = task.namespace.clone();
    let pod_name = task.pod_name.clone();

    let mut port_matched = false;
    let captured_exit = std::cell::Cell::new(None::<i32>);
    let wrapped = format!("{}; echo \"EXIT_CODE=$?\"", command);
    engine
        .orchestrator
        .run_command(&task.namespace, &task.pod_name, shell, &wrapped, |line| {
            if cancelled.load(Ordering::SeqCst) {
                return true;
            }
            if let Some(caps) = exit_re.captures(line) {
                if let Some(code) = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok()) {
                    captured_exit.set(Some(code));
                }
                return false;
            }
            if !port_matched {
                if let Some(captures) = port_re.captures(line) {
                    if let Some(port) = captures.get(2).and_then(|m| m.as_str().parse::<u16>().ok()) {
                        port_matched = true;
                        let engine = engine.clone();
                        let task_id = task_id.clone();
                        let namespace = namespace.clone();
                        let pod_name = pod_name.clone();
                        tokio::spawn(async move {
                            register_ui_port_by_id(&engine, &task_id, &namespace, &pod_name, port).await;
                        });
                    }
                }
            }
            false
        })
        .await?;

    if cancelled.load(Ordering::SeqCst) {
        return Ok(WorkerOutcome::Failed("cancelled".to_owned()));
    }
    match captured_exit.get() {
        Some(0) => Ok(WorkerOutcome::Completed(serde_json::Value::Null)),
        Some(n) => Ok(WorkerOutcome::Failed(format!("Package execution failed with exit code {}", n))),
        None => Ok(WorkerOutcome::Failed("command exited without producing an EXIT_CODE marker".to_owned())),
    }
}

/// First UI-port match for a task: records `is_ui_app`/`ui_ip_address`/
/// `ui_port` (write-once `original_ui_port` handled by the repository), and
/// in developer mode additionally establishes a local port-forward (C5),
/// rewriting the recorded address to `localhost:<local_port>` so the proxy
/// reaches the task through the tunnel instead of a pod IP the developer's
/// machine can't route to. Grounded on `match_port`'s handling in
/// `pod_api_wrapper.py`/`k8s_manager_service.py`.
async fn register_ui_port(engine: &Arc<ExecutionEngine>, task: &Task, port: u16) {
    register_ui_port_by_id(engine, &task.task_id, &task.namespace, &task.pod_name, port).await
}

async fn register_ui_port_by_id(engine: &Arc<ExecutionEngine>, task_id: &str, namespace: &str, pod_name: &str, port: u16) {
    if engine.config.developer_mode {
        match engine.port_forwards.open(namespace, pod_name, port).await {
            Ok((local_port, pid)) => {
                let _ = engine.repository.update_ui_info(task_id, "localhost", local_port).await;
                let _ = engine.repository.update_pid(task_id, pid as i32).await;
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "port-forward failed, falling back to pod IP");
            }
        }
    }
    let ip = match engine.orchestrator.get_pod(namespace, pod_name).await {
        Ok(Some(pod)) => pod.status.and_then(|s| s.pod_ip).unwrap_or_default(),
        _ => String::new(),
    };
    let _ = engine.repository.update_ui_info(task_id, &ip, port).await;
}

/// TERMINATE: always runs, closes the port-forward, deletes the pod
/// unless the task was cancelled out from under a still-alive pod that
/// cancellation has already started tearing down itself, and stamps the
/// task's final status. `update_status` is itself idempotent against a
/// second terminal write, so a race between this and an external
/// cancellation can never un-terminate a task.
pub async fn finalize(engine: &Arc<ExecutionEngine>, task_id: &str, outcome: Result<WorkerOutcome, Error>, was_cancelled: bool) {
    let task = match engine.repository.get_task(task_id).await {
        Ok(Some(task)) => task,
        _ => return,
    };

    engine.port_forwards.close(&task.pod_name).await;
    let _ = engine.orchestrator.delete_pod(&task.namespace, &task.pod_name).await;

    let (status, result, error) = if was_cancelled {
        (TaskStatus::Cancelled, None, None)
    } else {
        match outcome {
            Ok(WorkerOutcome::Completed(result)) => (TaskStatus::Completed, Some(result), None),
            Ok(WorkerOutcome::Failed(message)) => (TaskStatus::Failed, None, Some(message)),
            Ok(WorkerOutcome::TimedOut) => (TaskStatus::Timeout, None, Some("task exceeded its deadline".to_owned())),
            Err(e) => (TaskStatus::Failed, None, Some(e.to_string())),
        }
    };
    let _ = engine.task_logger.log(task_id, if status == TaskStatus::Completed { "INFO" } else { "ERROR" }, &format!("task finished: {}", status));
    engine.task_logger.forget(task_id);
    let _ = engine.repository.update_status(task_id, status, result, error).await;
}

/// Execs the SSH sidecar bootstrap into a running task pod. Grounded on
/// `install_ssh_server` in `pod_environment.py`; kept as a thin pass-through
/// off the core PREPARE/LAUNCH/OBSERVE machinery since it shares the same
/// shell-probe/exec primitives.
pub async fn install_ssh_server(engine: &Arc<ExecutionEngine>, task_id: &str) -> Result<(), Error> {
    let task = engine.repository.get_task(task_id).await?.ok_or_else(|| Error::TaskNotFound(task_id.to_owned()))?;
    let shell = engine.orchestrator.shell_probe(&task.namespace, &task.pod_name).await?;
    engine
        .orchestrator
        .run_command(
            &task.namespace,
            &task.pod_name,
            shell,
            "apt-get update && apt-get install -y openssh-server && service ssh start",
            |_| false,
        )
        .await?;
    Ok(())
}

/// Installs and starts the code-server editor sidecar, waiting for its
/// "server listening" announcement before registering `vscode_port`.
/// Grounded on `install_and_run_vscode_server`.
pub async fn install_and_run_vscode_server(engine: &Arc<ExecutionEngine>, task_id: &str) -> Result<(), Error> {
    let task = engine.repository.get_task(task_id).await?.ok_or_else(|| Error::TaskNotFound(task_id.to_owned()))?;
    let shell = engine.orchestrator.shell_probe(&task.namespace, &task.pod_name).await?;
    const VSCODE_PORT: u16 = 8080;
    engine
        .orchestrator
        .run_command(
            &task.namespace,
            &task.pod_name,
            shell,
            &format!("curl -fsSL https://code-server.dev/install.sh | sh && code-server --bind-addr 0.0.0.0:{} /app", VSCODE_PORT),
            |line| line.contains("server listening"),
        )
        .await?;
    let effective_port = if engine.config.developer_mode {
        match engine.port_forwards.open(&task.namespace, &task.pod_name, VSCODE_PORT).await {
            Ok((local_port, pid)) => {
                let _ = engine.repository.update_pid(task_id, pid as i32).await;
                local_port
            }
            Err(_) => VSCODE_PORT,
        }
    } else {
        VSCODE_PORT
    };
    engine.repository.update_vscode_port(task_id, effective_port).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched_port(line: &str) -> Option<u16> {
        port_regex().captures(line).and_then(|c| c.get(2)).and_then(|m| m.as_str().parse().ok())
    }

    #[test]
    fn matches_ipv4() {
        assert_eq!(matched_port("http://0.0.0.0:8501"), Some(8501));
        assert_eq!(matched_port("Running on 127.0.0.1:5000"), Some(5000));
        assert_eq!(matched_port("bound to 192.168.1.7:65000"), Some(65000));
    }

    #[test]
    fn matches_bracketed_ipv6() {
        assert_eq!(matched_port("[::1]:8080"), Some(8080));
    }

    #[test]
    fn no_match_for_version_string() {
        assert_eq!(matched_port("version 1.2.3"), None);
    }

    #[test]
    fn exit_code_marker() {
        let re = exit_code_regex();
        let caps = re.captures("EXIT_CODE=0").unwrap();
        assert_eq!(&caps[1], "0");
        assert!(re.captures("EXIT_CODE=17").is_some());
        assert!(re.captures("not a marker").is_none());
    }
}
