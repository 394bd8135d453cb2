use crate::Error;
use dashmap::DashMap;
use std::io::Write;
use std::path::PathBuf;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

/// Root directory under which per-task log files live, mirroring
/// `task_logger.py`'s `_get_system_logs_path`: `%PROGRAMDATA%\Kubernetes\
/// Lotse\logs` on Windows, `/var/Kubernetes/Lotse/logs` on Linux,
/// `~/Kubernetes/Lotse/logs` elsewhere. Same company/app segments as
/// `preparer::cache_root`, just rooted at `logs` instead of the cache tree.
pub fn logs_root() -> PathBuf {
    if cfg!(target_os = "windows") {
        let base = std::env::var("PROGRAMDATA").unwrap_or_else(|_| "C:\\ProgramData".to_owned());
        PathBuf::from(base).join("Kubernetes").join("Lotse").join("logs")
    } else if cfg!(target_os = "linux") {
        PathBuf::from("/var").join("Kubernetes").join("Lotse").join("logs")
    } else {
        std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(".")).join("Kubernetes").join("Lotse").join("logs")
    }
}

fn log_dir(task_id: &str) -> PathBuf {
    logs_root().join(task_id)
}

/// Path of a task's own log file: one directory per task id, one file per
/// directory, matching `get_log_file_path`.
pub fn log_file_path(task_id: &str) -> PathBuf {
    log_dir(task_id).join("task.log")
}

/// Reads a task's log file, newest line first. Missing file reads as no
/// lines rather than an error, since a task that never logged anything
/// (or was just created) has nothing to show yet.
pub async fn read_reversed(task_id: &str) -> Vec<String> {
    match tokio::fs::read_to_string(log_file_path(task_id)).await {
        Ok(contents) => {
            let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
            lines.reverse();
            lines
        }
        Err(_) => Vec::new(),
    }
}

/// One append-only, non-blocking file sink per task id, grounded on
/// `TaskLogger.setup_logger`'s per-task-id `logging.Logger` cache. Each
/// sink is a `tracing_appender` non-blocking writer over the task's own
/// log file, so a slow disk never stalls the worker loop that's logging
/// through it; the paired `WorkerGuard` is kept alongside the writer and
/// must outlive every write or the background flush thread is torn down.
#[derive(Default)]
pub struct TaskLogger {
    sinks: DashMap<String, (NonBlocking, WorkerGuard)>,
}

impl TaskLogger {
    pub fn new() -> Self {
        TaskLogger::default()
    }

    fn ensure_sink(&self, task_id: &str) -> Result<(), Error> {
        if self.sinks.contains_key(task_id) {
            return Ok(());
        }
        let dir = log_dir(task_id);
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::OpenOptions::new().create(true).append(true).open(log_dir(task_id).join("task.log"))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        self.sinks.insert(task_id.to_owned(), (writer, guard));
        Ok(())
    }

    /// Appends one `YYYY-MM-DD HH:MM:SS,mmm - LEVEL - message` line to the
    /// task's log file, opening and caching its sink on first use.
    pub fn log(&self, task_id: &str, level: &str, message: &str) -> Result<(), Error> {
        self.ensure_sink(task_id)?;
        let mut sink = self.sinks.get_mut(task_id).expect("sink just ensured");
        let line = format!("{} - {} - {}\n", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S,%3f"), level, message);
        sink.0.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Drops a task's cached sink, releasing the file handle and flush
    /// thread. Doesn't remove the file itself — unlike `clear_logs`, tasks
    /// here keep their history for `GET /task/{id}/logs` after completion.
    pub fn forget(&self, task_id: &str) {
        self.sinks.remove(task_id);
    }
}
