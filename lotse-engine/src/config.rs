use std::time::Duration;

/// Process-wide configuration, read once at startup from the environment.
/// Mirrors the handful of settings the original service kept in a module
/// of bare constants; collecting them into a struct here makes the engine
/// testable without mutating the real environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub openapi_prefix_path: String,
    /// Default execution deadline for packages that don't declare their own.
    pub global_task_timeout: Duration,
    /// How long the engine waits for a pod to reach `Running` before giving up.
    pub pod_scheduling_timeout: Duration,
    /// Upper bound on concurrently in-flight tasks (C8).
    pub queue_concurrency: usize,
    pub database_url: String,
    /// When true, the engine runs against a cluster it reaches via
    /// `kubectl`'s own kubeconfig rather than in-cluster credentials, and
    /// UI/editor traffic is proxied through a local port-forward (C5)
    /// instead of straight to the pod IP. Named after the original
    /// service's own toggle, which doubled as its "am I running on a
    /// developer's laptop" flag.
    pub developer_mode: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, lotse_common::Error> {
        Ok(Config {
            namespace: std::env::var("K8S_NAMESPACE").unwrap_or_else(|_| "default".to_owned()),
            openapi_prefix_path: std::env::var("OPENAPI_PREFIX_PATH").unwrap_or_default(),
            global_task_timeout: Duration::from_secs(
                std::env::var("GLOBAL_TASK_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            pod_scheduling_timeout: Duration::from_secs(
                std::env::var("POD_SCHEDULING_TIMEOUT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            queue_concurrency: std::env::var("QUEUE_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| std::cmp::min(8, num_cpus() + 4)),
            database_url: std::env::var("DATABASE_URL")?,
            developer_mode: std::env::var("VSCODE_DEBUG_MODE")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
