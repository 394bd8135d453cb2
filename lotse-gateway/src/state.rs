use dashmap::DashMap;
use lotse_engine::{ExecutionEngine, PackageLookup, TaskRepository};
use std::sync::Arc;

/// Which side channel a cached task-to-backend mapping belongs to. The
/// proxy and the editor sidecar proxy are routed through the same code
/// path but must never share a cache entry, since a task can have both a
/// UI port and a vscode port open at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyCacheKind {
    Proxy,
    Vscode,
}

#[derive(Debug, Clone)]
pub struct CachedEndpoint {
    pub ip: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ExecutionEngine>,
    pub repository: Arc<dyn TaskRepository>,
    pub packages: Arc<dyn PackageLookup>,
    pub http: reqwest::Client,
    pub proxy_cache: Arc<DashMap<String, CachedEndpoint>>,
    pub vscode_cache: Arc<DashMap<String, CachedEndpoint>>,
    pub openapi_prefix_path: String,
    pub hostname: String,
    /// Port every replica's gateway listens on, so the cross-replica
    /// cancel hop in `routes::task::cancel` can address a sibling by its
    /// `ip_address` alone instead of hardcoding the port.
    pub control_port: u16,
}

impl AppState {
    pub fn cache_for(&self, kind: ProxyCacheKind) -> &DashMap<String, CachedEndpoint> {
        match kind {
            ProxyCacheKind::Proxy => &self.proxy_cache,
            ProxyCacheKind::Vscode => &self.vscode_cache,
        }
    }
}
