//! Owned background tasks.
//!
//! Every recurring job of the client (store sweep, token refresh, storage
//! polling, the cross-context event bridge) runs as a [`ScheduledTask`]. The
//! task is aborted by [`ScheduledTask::stop`] or when the handle is dropped,
//! so its lifetime is bound to whoever owns it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

pub struct ScheduledTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Spawn `future` as a named task on the current tokio runtime.
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "Background task started");
        Self {
            name,
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Run `job` after `first_delay`, then again `period` after each run
    /// completes.
    ///
    /// Runs never overlap, and the gap between the end of one run and the
    /// start of the next is always at least `period`.
    pub fn every<F, Fut>(
        name: &'static str,
        period: Duration,
        first_delay: Duration,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, async move {
            tokio::time::sleep(first_delay).await;
            loop {
                job().await;
                tokio::time::sleep(period).await;
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Abort the task. Stopping twice is a no-op.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(task = self.name, "Background task stopped");
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_every_runs_periodically() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = ScheduledTask::every(
            "tick",
            Duration::from_secs(10),
            Duration::from_secs(10),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_the_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut task =
            ScheduledTask::every("tick", Duration::from_secs(1), Duration::ZERO, move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.stop();
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        assert!(!task.is_running());
        task.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = ScheduledTask::every(
            "tick",
            Duration::from_secs(1),
            Duration::from_secs(1),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        drop(task);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_counts_from_end_of_run() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let _task = ScheduledTask::every(
            "slow",
            Duration::from_secs(10),
            Duration::ZERO,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            },
        );

        // Runs start at 0s and 15s.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }
}
