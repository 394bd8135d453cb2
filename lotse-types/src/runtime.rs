use serde::{Deserialize, Serialize};

/// How a package's artifact is executed once its pod is scheduled.
///
/// Three kinds exist where the original service had two (`python`/`binary`)
/// plus an ad-hoc third path for container-native packages; this enum makes
/// that third path a first-class variant instead of a string comparison
/// sprinkled through the call sites.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    /// Package artifact is interpreted source (e.g. Python) executed inside
    /// a venv prepared once per (package, version, stage) and cached.
    Interpreted,
    /// Package artifact is a standalone native binary; no interpreter setup.
    NativeBinary,
    /// The package's own container image is the runtime; the pod's command
    /// is left as the image's entrypoint instead of `sleep infinity`.
    PrebuiltContainer,
}

impl Runtime {
    /// Whether this runtime needs the pod kept alive with a placeholder
    /// command so the caller can exec the real workload into it afterwards.
    pub fn needs_placeholder_command(&self) -> bool {
        !matches!(self, Runtime::PrebuiltContainer)
    }
}
