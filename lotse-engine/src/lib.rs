pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod package_lookup;
pub mod port_forward;
pub mod preparer;
pub mod queue;
pub mod repository;

pub use config::Config;
pub use engine::ExecutionEngine;
pub use orchestrator::OrchestratorClient;
pub use package_lookup::{PackageLookup, PgPackageLookup};
pub use port_forward::PortForwardRegistry;
pub use preparer::{InterpretedPreparer, NativeBinaryPreparer, PrebuiltContainerPreparer, RuntimePreparer};
pub use queue::TaskQueue;
pub use repository::{PgTaskRepository, TaskRepository};

use std::collections::HashMap;
use std::sync::Arc;

/// Builds the standard preparer set, one per [`lotse_types::Runtime`]
/// variant. Split out of `main` so the gateway binary doesn't need to know
/// the map's keys.
pub fn default_preparers(orchestrator: Arc<OrchestratorClient>) -> HashMap<&'static str, Arc<dyn RuntimePreparer>> {
    let mut preparers: HashMap<&'static str, Arc<dyn RuntimePreparer>> = HashMap::new();
    preparers.insert("interpreted", Arc::new(InterpretedPreparer::new(orchestrator.clone())));
    preparers.insert("native_binary", Arc::new(NativeBinaryPreparer::new(orchestrator)));
    preparers.insert("prebuilt_container", Arc::new(PrebuiltContainerPreparer));
    preparers
}
