/// All errors possible to occur in the execution engine and gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate
    #[error("Kubernetes error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// Database error from the task repository
    #[error("database error: {source}")]
    DbError {
        #[from]
        source: sqlx::Error,
    },

    /// Error converting a string to UTF-8
    #[error("UTF-8 error: {source}")]
    Utf8Error {
        #[from]
        source: std::str::Utf8Error,
    },

    /// Serde json decode error
    #[error("decode json error: {source}")]
    JSONError {
        #[from]
        source: serde_json::Error,
    },

    /// Environment variable error
    #[error("missing environment variable: {source}")]
    EnvError {
        #[from]
        source: std::env::VarError,
    },

    #[error("i/o error: {source}")]
    IOError {
        #[from]
        source: std::io::Error,
    },

    #[error("reqwest error: {source}")]
    ReqwestError {
        #[from]
        source: reqwest::Error,
    },

    #[error("websocket error: {source}")]
    WebSocketError {
        #[from]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("system time error: {source}")]
    SystemTimeError {
        #[from]
        source: std::time::SystemTimeError,
    },

    /// The task's pod never reached `Running` within the configured window.
    #[error("pod scheduling timed out: {0}")]
    SchedulingTimeout(String),

    /// No shell (`/bin/bash`, `/bin/sh`) could be found in the task's pod.
    #[error("no usable shell found in pod {0}")]
    NoShellAvailable(String),

    /// Execution exceeded its deadline and was terminated by the engine.
    #[error("task {0} timed out")]
    TaskTimeout(String),

    /// Caller tried to act on a task that doesn't exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Caller referenced a `(name, stage, version)` that doesn't resolve to
    /// any deployed package.
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// Operation incompatible with the task's current status: deleting a
    /// non-terminal task, cancelling one that's already terminal.
    #[error("bad task state: {0}")]
    BadState(String),

    /// A runtime preparer's cache build (e.g. venv setup) exited non-zero.
    #[error("prepare failed: {0}")]
    PrepareFailed(String),

    /// The task's pod never reached `Running`, or vanished unexpectedly.
    #[error("pod failed: {0}")]
    PodFailed(String),

    /// The reverse proxy could not reach a task's backend.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Error in user input, typically a malformed execution request.
    #[error("invalid execution request: {0}")]
    UserInputError(String),

    /// Generic error based on a string description
    #[error("error: {0}")]
    GenericError(String),
}

impl Error {
    /// Maps this error to the HTTP status code its spec error kind carries.
    /// Kept here rather than as a blanket `IntoResponse` impl so this crate
    /// doesn't need to depend on `axum`.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::TaskNotFound(_) | Error::PackageNotFound(_) => 404,
            Error::BadState(_) => 409,
            Error::UserInputError(_) => 400,
            Error::UpstreamUnreachable(_) => 502,
            Error::KubeError { source: kube::Error::Api(ae) } if ae.code == 404 => 404,
            _ => 500,
        }
    }
}
