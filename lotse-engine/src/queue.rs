use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Bounded-concurrency FIFO for background work that doesn't belong on the
/// request path: reconnecting a port-forward after a restart, installing
/// an editor sidecar, polling a vscode readiness signal. Grounded on
/// `global_queue_handler.py`'s `TaskQueue`, which ran a fixed pool of
/// worker threads pulling off a shared queue; here a single dispatcher
/// task pulls submissions and spawns each one behind a semaphore permit,
/// which gets the same bound without hand-rolling a thread pool.
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl TaskQueue {
    pub fn new(concurrency: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });
            }
        });
        TaskQueue { sender }
    }

    /// Enqueues `job` for background execution. Returns immediately; the
    /// job runs once a concurrency permit is available.
    pub fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // An error here means the dispatcher task has died, which only
        // happens if the whole process is shutting down.
        let _ = self.sender.send(Box::pin(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn enqueue_respects_concurrency_bound() {
        let queue = TaskQueue::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            queue.enqueue(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
