use lotse_common::{Error, PORT_FORWARD_POLL_ATTEMPTS, PORT_FORWARD_POLL_INTERVAL};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Tracks live `kubectl port-forward` child processes keyed by pod name, so
/// a forward can be torn down exactly once when its task terminates instead
/// of leaking a subprocess per task.
pub struct PortForwardRegistry {
    forwards: Mutex<HashMap<String, Child>>,
}

impl Default for PortForwardRegistry {
    fn default() -> Self {
        PortForwardRegistry {
            forwards: Mutex::new(HashMap::new()),
        }
    }
}

impl PortForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `kubectl port-forward pod/<name> :<remote_port>` and returns
    /// the local port it bound to, read off the process's own
    /// `Forwarding from 127.0.0.1:<port>` announcement, plus the child's own
    /// OS pid so the caller can record it on the task for reconciliation to
    /// kill on restart. Polls up to [`PORT_FORWARD_POLL_ATTEMPTS`] times,
    /// matching the original's fixed retry loop in `pod_port_manager.py`.
    pub async fn open(&self, namespace: &str, pod_name: &str, remote_port: u16) -> Result<(u16, u32), Error> {
        let mut child = Command::new("kubectl")
            .args(["port-forward", "-n", namespace, &format!("pod/{}", pod_name), &format!(":{}", remote_port)])
            .stdout(std::process::Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();
        let re = Regex::new(r"Forwarding from 127\.0\.0\.1:(\d+)").expect("valid regex");

        let mut local_port = None;
        for _ in 0..PORT_FORWARD_POLL_ATTEMPTS {
            match tokio::time::timeout(PORT_FORWARD_POLL_INTERVAL, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    if let Some(captures) = re.captures(&line) {
                        local_port = captures.get(1).and_then(|m| m.as_str().parse().ok());
                        break;
                    }
                }
                Ok(Ok(None)) => break,
                _ => continue,
            }
        }

        match local_port {
            Some(port) => {
                let pid = child.id().unwrap_or_default();
                self.forwards.lock().expect("port forward registry lock poisoned").insert(pod_name.to_owned(), child);
                Ok((port, pid))
            }
            None => {
                let _ = child.kill().await;
                Err(Error::GenericError(format!("port-forward for pod {} never announced a local port", pod_name)))
            }
        }
    }

    /// Kills and forgets the forward for `pod_name`, if one is open.
    /// Forgetting a forward that was never opened is not an error; tasks
    /// without a UI port never open one.
    pub async fn close(&self, pod_name: &str) {
        let child = self.forwards.lock().expect("port forward registry lock poisoned").remove(pod_name);
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
    }
}
