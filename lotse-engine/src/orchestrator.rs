use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{AttachParams, DeleteParams, ListParams, LogParams, PostParams},
    Api, Client,
};
use lotse_common::{check_pod_scheduling_error, resource, Error};
use lotse_types::PodMetrics;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Candidate shells to probe for, in order of preference.
const SHELL_CANDIDATES: [&str; 2] = ["/bin/bash", "/bin/sh"];

/// Thin wrapper over `kube::Client` providing the pod lifecycle and exec
/// primitives the execution engine is built on. API-call setup (building
/// the `Api<Pod>` handle and issuing the request) is serialized behind a
/// single mutex, mirroring the original service's `k8s_api_lock`, which
/// existed because the underlying client library was not safe to drive
/// concurrently from multiple threads.
pub struct OrchestratorClient {
    client: Client,
    lock: Mutex<()>,
}

impl OrchestratorClient {
    pub fn new(client: Client) -> Self {
        OrchestratorClient {
            client,
            lock: Mutex::new(()),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, Error> {
        let _guard = self.lock.lock().await;
        Ok(self.pods(namespace).create(&PostParams::default(), &pod).await?)
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let _guard = self.lock.lock().await;
        match self.pods(namespace).get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Force-deletes the pod. Missing pods are not an error: by the time
    /// the engine tears a task down the pod may already be gone.
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        match self.pods(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Polls until the pod reaches `Running`, or returns
    /// [`Error::SchedulingTimeout`]. Polling rather than watching mirrors
    /// `wait_for_pod_running`'s 1-second loop in the original service;
    /// a watch-based version would race the same apiserver far harder for
    /// comparable latency on pods that are already past `Pending`.
    pub async fn wait_for_running(&self, namespace: &str, name: &str, timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(pod) = self.get_pod(namespace, name).await? {
                if let Some(status) = pod.status.as_ref() {
                    if let Some(message) = check_pod_scheduling_error(status) {
                        return Err(Error::SchedulingTimeout(message));
                    }
                    if status.phase.as_deref() == Some("Running") {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::SchedulingTimeout(format!(
                    "pod {} did not reach Running within {:?}",
                    name, timeout
                )));
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Lists the names of pods in `namespace` carrying `app=<label>`, used
    /// by startup reconciliation to find orphaned task pods without
    /// touching any unrelated workload sharing the namespace.
    pub async fn list_pods_with_label(&self, namespace: &str, label: &str) -> Result<Vec<String>, Error> {
        let _guard = self.lock.lock().await;
        let params = ListParams::default().labels(&format!("app={}", label));
        let pods = self.pods(namespace).list(&params).await?;
        Ok(pods.items.into_iter().filter_map(|pod| pod.metadata.name).collect())
    }

    /// Returns all container statuses ready, the readiness signal the
    /// prebuilt-container observation loop polls on instead of exec.
    pub async fn containers_ready(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let pod = match self.get_pod(namespace, name).await? {
            Some(pod) => pod,
            None => return Ok(false),
        };
        let statuses = match pod.status.and_then(|s| s.container_statuses) {
            Some(statuses) if !statuses.is_empty() => statuses,
            _ => return Ok(false),
        };
        Ok(statuses.iter().all(|s| s.ready))
    }

    /// Called once `containers_ready` has gone false, to tell a container
    /// runtime package's own entrypoint exiting cleanly apart from the pod
    /// actually failing: pod phase `Failed`, or any container terminated
    /// with a non-zero exit code, reports the first such reason found. A
    /// pod that's simply vanished (already garbage-collected) or whose
    /// containers terminated with exit code 0 reports `None`, since those
    /// are ordinary completions, not failures.
    pub async fn pod_failure_reason(&self, namespace: &str, name: &str) -> Result<Option<String>, Error> {
        let pod = match self.get_pod(namespace, name).await? {
            Some(pod) => pod,
            None => return Ok(None),
        };
        let status = match pod.status {
            Some(status) => status,
            None => return Ok(None),
        };
        if status.phase.as_deref() == Some("Failed") {
            return Ok(Some(status.message.unwrap_or_else(|| "pod phase is Failed".to_owned())));
        }
        for container in status.container_statuses.into_iter().flatten() {
            if let Some(terminated) = container.state.and_then(|s| s.terminated) {
                if terminated.exit_code != 0 {
                    return Ok(Some(format!(
                        "container {} terminated with exit code {}: {}",
                        container.name,
                        terminated.exit_code,
                        terminated.message.or(terminated.reason).unwrap_or_default()
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Probes for a usable shell inside the container, trying `/bin/bash`
    /// before falling back to `/bin/sh`. Returns [`Error::NoShellAvailable`]
    /// if neither is present.
    pub async fn shell_probe(&self, namespace: &str, name: &str) -> Result<&'static str, Error> {
        for shell in SHELL_CANDIDATES {
            let params = AttachParams {
                stdout: true,
                stderr: true,
                ..AttachParams::default()
            };
            let attempt = tokio::time::timeout(
                Duration::from_secs(2),
                self.pods(namespace).exec(name, vec!["ls", shell], &params),
            )
            .await;
            if let Ok(Ok(mut proc)) = attempt {
                if let Some(status) = proc.take_status() {
                    if let Some(status) = status.await {
                        if status.status.as_deref() == Some("Success") {
                            return Ok(shell);
                        }
                    }
                }
            }
        }
        Err(Error::NoShellAvailable(name.to_owned()))
    }

    /// Execs `command` in the pod via `shell -c`, calling `on_line` for
    /// every line read from stdout and stderr as it arrives. `on_line`
    /// returning `true` closes the stream early and the call returns `0`,
    /// matching `PodExecutor.run_command`'s line-callback contract, which
    /// is how the engine's UI-port and editor-ready matchers short-circuit
    /// a command that will otherwise run until the task's own deadline.
    pub async fn run_command<F>(
        &self,
        namespace: &str,
        name: &str,
        shell: &str,
        command: &str,
        mut on_line: F,
    ) -> Result<i32, Error>
    where
        F: FnMut(&str) -> bool,
    {
        let params = AttachParams {
            stdout: true,
            stderr: true,
            ..AttachParams::default()
        };
        let mut proc = self
            .pods(namespace)
            .exec(name, vec![shell, "-c", command], &params)
            .await?;
        let stdout = proc.stdout().expect("attach requested stdout");
        let mut lines = futures::io::BufReader::new(stdout).lines();
        while let Some(line) = lines.next().await {
            let line = line?;
            if on_line(&line) {
                // Dropping the process handle closes the attach stream;
                // the task that's interested in this line (a UI port match,
                // an editor-ready signal) doesn't need the command's exit code.
                drop(lines);
                drop(proc);
                return Ok(0);
            }
        }
        drop(lines);
        match proc.take_status() {
            Some(status) => match status.await {
                Some(status) if status.status.as_deref() == Some("Success") => Ok(0),
                _ => Ok(1),
            },
            None => Ok(0),
        }
    }

    pub async fn read_logs(&self, namespace: &str, name: &str, tail_lines: Option<i64>) -> Result<String, Error> {
        let _guard = self.lock.lock().await;
        let params = LogParams {
            tail_lines,
            timestamps: false,
            ..LogParams::default()
        };
        Ok(self.pods(namespace).logs(name, &params).await?)
    }

    /// Copies a local path into the pod via the `kubectl cp` CLI, the same
    /// mechanism `copy_files_to_pod` shells out to; the `kube` crate has no
    /// native multi-file copy subresource.
    pub async fn copy_in(&self, namespace: &str, name: &str, local_path: &str, remote_path: &str) -> Result<(), Error> {
        run_kubectl_cp(local_path, &format!("{}/{}:{}", namespace, name, remote_path)).await
    }

    pub async fn copy_out(&self, namespace: &str, name: &str, remote_path: &str, local_path: &str) -> Result<(), Error> {
        run_kubectl_cp(&format!("{}/{}:{}", namespace, name, remote_path), local_path).await
    }

    /// Reads the pod's current CPU/memory usage from the metrics API,
    /// parsed into human units via [`lotse_common::resource`]. Returns
    /// `None` if the metrics-server has no sample for this pod yet (not an
    /// error: brand new pods simply haven't been scraped).
    pub async fn read_metrics(&self, namespace: &str, name: &str) -> Result<Option<PodMetrics>, Error> {
        use kube::core::{DynamicObject, GroupVersionKind};
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let (ar, _caps) = kube::discovery::pinned_kind(&self.client, &gvk).await?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let obj = match api.get(name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let containers = obj
            .data
            .get("containers")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut cpu_total = String::from("0");
        let mut mem_total = String::from("0");
        if let Some(first) = containers.first() {
            if let Some(cpu) = first.get("usage").and_then(|u| u.get("cpu")).and_then(|v| v.as_str()) {
                cpu_total = cpu.to_owned();
            }
            if let Some(mem) = first.get("usage").and_then(|u| u.get("memory")).and_then(|v| v.as_str()) {
                mem_total = mem.to_owned();
            }
        }
        Ok(Some(PodMetrics {
            cpu: resource::parse_cpu(&cpu_total),
            memory: resource::parse_memory(&mem_total),
        }))
    }
}

async fn run_kubectl_cp(src: &str, dst: &str) -> Result<(), Error> {
    let status = Command::new("kubectl").arg("cp").arg(src).arg(dst).status().await?;
    if !status.success() {
        return Err(Error::GenericError(format!("kubectl cp {} {} failed: {}", src, dst, status)));
    }
    Ok(())
}
