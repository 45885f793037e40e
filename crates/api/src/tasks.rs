//! Tracked background work
//!
//! Webhook processing runs after the response is sent. Tasks are kept in a
//! `JoinSet` so shutdown can wait for them instead of dropping them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};

#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tasks: Arc<Mutex<JoinSet<&'static str>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the background under `name`
    pub async fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;

        // Reap whatever already finished so the set stays small
        while let Some(result) = tasks.try_join_next() {
            log_outcome(result);
        }

        tasks.spawn(async move {
            task.await;
            name
        });
    }

    /// Tasks still running or not yet reaped
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait up to `timeout` for every task, then abort the rest
    ///
    /// Returns how many tasks were aborted.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let mut tasks = self.tasks.lock().await;
        let pending = tasks.len();
        if pending > 0 {
            tracing::info!(pending = pending, "Waiting for background tasks");
        }

        let finished = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_outcome(result);
            }
        })
        .await;

        if finished.is_ok() {
            return 0;
        }

        let aborted = tasks.len();
        tracing::warn!(
            aborted = aborted,
            timeout_secs = timeout.as_secs(),
            "Background tasks did not finish before shutdown, aborting"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        aborted
    }
}

fn log_outcome(result: Result<&'static str, JoinError>) {
    match result {
        Ok(name) => tracing::debug!(task = name, "Background task finished"),
        Err(e) if e.is_panic() => tracing::error!(error = %e, "Background task panicked"),
        Err(e) => tracing::warn!(error = %e, "Background task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks
                .spawn("counter", async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert_eq!(tasks.drain(Duration::from_secs(5)).await, 0);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(tasks.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_aborts_after_timeout() {
        let tasks = BackgroundTasks::new();
        tasks
            .spawn("stuck", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;

        assert_eq!(tasks.drain(Duration::from_millis(20)).await, 1);
        assert!(tasks.is_empty().await);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_poison_set() {
        let tasks = BackgroundTasks::new();
        tasks
            .spawn("boom", async {
                if true {
                    panic!("boom");
                }
            })
            .await;
        tasks.spawn("fine", async {}).await;

        assert_eq!(tasks.drain(Duration::from_secs(5)).await, 0);
    }
}
