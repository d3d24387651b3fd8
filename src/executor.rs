//! 阻塞文件操作的有界工作池。
//!
//! Filesystem mutations (chunk writes, merges, deletes, hard links and copies)
//! run on tokio's blocking threads, but at most `workers` of them at a time.
//! Waiting submitters queue on a fair semaphore, so the queue itself is
//! unbounded and callers that need backpressure must apply their own.
//! Once a task has been handed to a worker it runs to completion even if the
//! awaiting request goes away.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("blocking executor is shut down")]
    Closed,
    #[error("blocking task panicked")]
    Panicked,
    #[error("blocking task was cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct BlockingExecutor {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl BlockingExecutor {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 提交阻塞任务并等待其结果。
    pub async fn submit<F, T>(&self, task: F) -> Result<T, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Closed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        })
        .await
        .map_err(|err| {
            if err.is_panic() {
                ExecutorError::Panicked
            } else {
                ExecutorError::Cancelled
            }
        })
    }

    /// Rejects queued and future submissions; running tasks finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn submit_returns_task_result() {
        let executor = BlockingExecutor::new(2);
        let value = executor.submit(|| 40 + 2).await.expect("submit");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn zero_workers_still_runs_tasks() {
        let executor = BlockingExecutor::new(0);
        assert_eq!(executor.workers(), 1);
        assert!(executor.submit(|| true).await.expect("submit"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_worker_count() {
        let executor = BlockingExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let executor = executor.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .submit(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("submit");
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let executor = BlockingExecutor::new(1);
        let result = executor.submit(|| -> u32 { panic!("boom") }).await;
        assert!(matches!(result, Err(ExecutorError::Panicked)));

        let value = executor.submit(|| "still alive").await.expect("submit");
        assert_eq!(value, "still alive");
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let executor = BlockingExecutor::new(1);
        executor.shutdown();
        let result = executor.submit(|| ()).await;
        assert!(matches!(result, Err(ExecutorError::Closed)));
    }
}
