use std::fmt;

/// The four-phase lifecycle every task worker drives a task through.
/// Unlike the `Controller`-driven reconcilers this engine is descended
/// from, a task worker never revisits an earlier phase: it's a single
/// pass from `Prepare` to `Terminate`, not a requeue loop, because a task
/// execution (unlike a CRD) has no steady state to settle into — it runs
/// once and ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Launch,
    Observe,
    Terminate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Prepare => "PREPARE",
            Phase::Launch => "LAUNCH",
            Phase::Observe => "OBSERVE",
            Phase::Terminate => "TERMINATE",
        };
        write!(f, "{}", s)
    }
}
