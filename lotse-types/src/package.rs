use serde::{Deserialize, Serialize};

use crate::Runtime;

/// Declared argument of a package's entrypoint. Read-only metadata owned by
/// package management; the execution engine only consults it to validate
/// and default incoming execution requests.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PackageArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArgumentType,
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    pub description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Number,
    Boolean,
}

/// A deployed, versioned package. Packages are created and managed outside
/// this crate (package CRUD is an external collaborator); this is the
/// read-only projection the execution engine needs to launch a task.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Package {
    pub deployment_id: String,
    pub package_name: String,
    pub version: String,
    pub python_version: Option<String>,
    pub stage: String,
    pub runtime: Runtime,
    pub image: String,
    pub arguments: Vec<PackageArgument>,
    pub active: bool,
    /// Filename of the package's entrypoint, relative to `/app` once its
    /// files are copied into the pod (e.g. `main.py`, `run`).
    pub entrypoint: String,
    /// Per-package override of the global task timeout, in seconds.
    /// `Some(0)` disables the timeout entirely; `None` defers to
    /// `Config::global_task_timeout`.
    pub timeout_seconds: Option<u64>,
}
