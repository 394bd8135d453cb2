mod action;
mod worker;

pub use action::Phase;
pub use worker::{install_and_run_vscode_server, install_ssh_server};

use crate::config::Config;
use crate::orchestrator::OrchestratorClient;
use crate::port_forward::PortForwardRegistry;
use crate::preparer::RuntimePreparer;
use crate::queue::TaskQueue;
use crate::repository::TaskRepository;
use lotse_common::{Error, TaskLogger};
use lotse_types::{Package, Runtime, Task, TaskArgument, TaskStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a running task needs to look up from the outside: the
/// orchestrator client, the task repository, the port-forward registry,
/// the background queue, and the runtime preparers, all shared behind
/// `Arc` so each task worker owns a cheap clone of the handle rather than
/// borrowing from a `Controller`-owned context the way the reconcilers
/// this is descended from did.
pub struct ExecutionEngine {
    pub orchestrator: Arc<OrchestratorClient>,
    pub repository: Arc<dyn TaskRepository>,
    pub port_forwards: Arc<PortForwardRegistry>,
    pub queue: Arc<TaskQueue>,
    pub config: Config,
    pub hostname: String,
    /// This replica's own address, as recorded on every task it starts
    /// (`task.ip_address`). Distinct from `hostname`: the gateway's
    /// cross-replica cancel hop (§4.4.4) must compare against this, not the
    /// hostname, or the "is this task mine" check never matches and every
    /// cancel hairpins over HTTP back to the replica that already owns it.
    pub ip_address: String,
    pub task_logger: Arc<TaskLogger>,
    preparers: HashMap<&'static str, Arc<dyn RuntimePreparer>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl ExecutionEngine {
    pub fn new(
        orchestrator: Arc<OrchestratorClient>,
        repository: Arc<dyn TaskRepository>,
        port_forwards: Arc<PortForwardRegistry>,
        queue: Arc<TaskQueue>,
        config: Config,
        hostname: String,
        preparers: HashMap<&'static str, Arc<dyn RuntimePreparer>>,
    ) -> Self {
        ExecutionEngine {
            orchestrator,
            repository,
            port_forwards,
            queue,
            config,
            hostname,
            ip_address: local_ip_address(),
            task_logger: Arc::new(TaskLogger::new()),
            preparers,
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    fn preparer_for(&self, runtime: Runtime) -> Arc<dyn RuntimePreparer> {
        let key = match runtime {
            Runtime::Interpreted => "interpreted",
            Runtime::NativeBinary => "native_binary",
            Runtime::PrebuiltContainer => "prebuilt_container",
        };
        self.preparers.get(key).cloned().expect("preparer registered for every Runtime variant")
    }

    /// Starts a package execution. Generates the task id and pod name,
    /// persists the `Initializing` row, and spawns the per-task worker on
    /// a background thread-backed task, returning immediately the way
    /// `execute_package_async` hands a task id back before the pod even
    /// exists. The deadline raced against the worker is the package's own
    /// `timeout_seconds` override when declared, falling back to
    /// `Config::global_task_timeout`; either one resolving to zero seconds
    /// disables the timeout entirely (§4.4.1 step 4).
    pub async fn start(
        self: &Arc<Self>,
        package: Package,
        deployment_id: String,
        arguments: Vec<TaskArgument>,
        empty_instance: bool,
    ) -> Result<String, Error> {
        let deadline = match package.timeout_seconds {
            Some(0) => None,
            Some(secs) => Some(std::time::Duration::from_secs(secs)),
            None if self.config.global_task_timeout.is_zero() => None,
            None => Some(self.config.global_task_timeout),
        };
        let task_id = lotse_common::name::generate_name(&package.package_name);
        let pod_name = task_id.clone();
        let task = Task {
            task_id: task_id.clone(),
            deployment_id,
            package_name: package.package_name.clone(),
            package_version: package.version.clone(),
            stage: package.stage.clone(),
            status: TaskStatus::Initializing,
            pod_name: pod_name.clone(),
            namespace: self.config.namespace.clone(),
            hostname: self.hostname.clone(),
            ip_address: self.ip_address.clone(),
            pid: None,
            result: None,
            error: None,
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
            is_ui_app: false,
            ui_ip_address: None,
            ui_port: None,
            original_ui_port: None,
            vscode_port: None,
            arguments,
        };
        self.repository.add_task(&task).await?;

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.lock().await.insert(task_id.clone(), cancel_flag.clone());

        let engine = self.clone();
        let task_id_for_worker = task_id.clone();
        tokio::spawn(async move {
            let run = worker::run(engine.clone(), task.clone(), package, empty_instance, cancel_flag.clone());
            let outcome: Result<worker::WorkerOutcome, Error> = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        result = run => result,
                        _ = tokio::time::sleep(deadline) => Ok(worker::WorkerOutcome::TimedOut),
                    }
                }
                None => run.await,
            };
            worker::finalize(&engine, &task_id_for_worker, outcome, cancel_flag.load(Ordering::SeqCst)).await;
            engine.cancel_flags.lock().await.remove(&task_id_for_worker);
        });

        Ok(task_id)
    }

    /// Requests cancellation of a running task. If the task is running on
    /// this replica the cancel flag is set directly; otherwise the caller
    /// is expected to have already routed the request to `task.ip_address`
    /// (see the gateway's cancel route), matching `task.py`'s cross-replica
    /// hop.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, Error> {
        match self.cancel_flags.lock().await.get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Startup reconciliation, grounded on `check_and_initialize_pods`:
    ///
    /// 1. For every task this replica owns and still has recorded as
    ///    `Initializing`/`Running`: if its pod is gone or isn't `Running`,
    ///    the worker that would have observed it is also gone (it died with
    ///    the previous process), so the task can never finish on its own —
    ///    fail it outright. Otherwise re-establish the in-memory state
    ///    (port-forward, vscode sidecar) the dead process used to hold. The
    ///    port-forward and its rewritten `localhost:<local_port>` UI address
    ///    are only re-established in developer mode, matching
    ///    `register_ui_port_by_id`'s own gating.
    /// 2. For every pod carrying the core label in this namespace: delete
    ///    it if it has no matching task row (orphan) or the matching task
    ///    has already reached a terminal status — in both cases nothing
    ///    will ever act on that pod again.
    pub async fn reconcile_on_startup(self: &Arc<Self>) -> Result<(), Error> {
        let running = self.repository.running_tasks_on_host(&self.hostname).await?;
        for task in &running {
            let pod = self.orchestrator.get_pod(&task.namespace, &task.pod_name).await?;
            let is_running = pod
                .as_ref()
                .and_then(|p| p.status.as_ref())
                .and_then(|s| s.phase.as_deref())
                == Some("Running");
            if !is_running {
                // The owning replica died along with whatever exec loop was
                // watching this pod; nothing is left to ever report a
                // result, so fail it and reclaim the pod if it's still there.
                self.repository
                    .update_status(&task.task_id, TaskStatus::Failed, None, Some("pod not running after restart".to_owned()))
                    .await?;
                if pod.is_some() {
                    self.orchestrator.delete_pod(&task.namespace, &task.pod_name).await?;
                }
                if let Some(pid) = task.pid {
                    kill_recorded_pid(pid);
                }
                continue;
            }
            if let (true, Some(port)) = (self.config.developer_mode, task.ui_port) {
                if let Ok((local_port, pid)) = self.port_forwards.open(&task.namespace, &task.pod_name, port).await {
                    let _ = self.repository.update_ui_info(&task.task_id, "localhost", local_port).await;
                    let _ = self.repository.update_pid(&task.task_id, pid as i32).await;
                }
            }
            if task.vscode_port.is_some() {
                self.queue.enqueue({
                    let engine = self.clone();
                    let task_id = task.task_id.clone();
                    async move {
                        let _ = worker::install_and_run_vscode_server(&engine, &task_id).await;
                    }
                });
            }
        }

        let labeled_pods = self
            .orchestrator
            .list_pods_with_label(&self.config.namespace, lotse_common::pod::CORE_LABEL)
            .await?;
        for pod_name in labeled_pods {
            // Pod name equals task id for every pod this engine creates.
            let should_delete = match self.repository.get_task(&pod_name).await? {
                Some(task) => task.status.is_terminal(),
                None => true,
            };
            if should_delete {
                self.orchestrator.delete_pod(&self.config.namespace, &pod_name).await?;
            }
        }

        Ok(())
    }
}

fn local_ip_address() -> String {
    std::env::var("POD_IP").unwrap_or_else(|_| "127.0.0.1".to_owned())
}

/// Best-effort kill of a developer-mode port-forward subprocess left
/// dangling by a dead engine process, grounded on `kill_and_update_task`'s
/// `psutil.Process(pid).kill()`. A missing process is not an error: the OS
/// may have already reaped it.
fn kill_recorded_pid(pid: i32) {
    let _ = std::process::Command::new("kill").arg("-9").arg(pid.to_string()).status();
}
