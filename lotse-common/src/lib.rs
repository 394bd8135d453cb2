use k8s_openapi::api::core::v1::PodStatus;
use tokio::time::Duration;

pub mod args;
pub mod name;
pub mod pod;
pub mod resource;
pub mod task_logger;

mod error;

pub use error::Error;
pub use task_logger::TaskLogger;

/// How long a port-forward's readiness poll loop waits between attempts.
pub const PORT_FORWARD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How many times the port-forward readiness loop polls before giving up.
pub const PORT_FORWARD_POLL_ATTEMPTS: u32 = 10;

/// Inspects a pod's status conditions for a `PodScheduled == False`
/// condition, returning its message if present. Used by the execution
/// engine to surface a clear error instead of waiting out the full
/// scheduling timeout when the scheduler has already given up.
pub fn check_pod_scheduling_error(status: &PodStatus) -> Option<String> {
    let conditions: &Vec<_> = match status.conditions.as_ref() {
        Some(conditions) => conditions,
        None => return None,
    };
    for condition in conditions {
        if condition.type_ == "PodScheduled" && condition.status == "False" {
            return Some(
                condition
                    .message
                    .as_deref()
                    .unwrap_or("PodScheduled == False, but no message was provided")
                    .to_owned(),
            );
        }
    }
    None
}
