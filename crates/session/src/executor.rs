//! Background task scheduling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Runs fire-and-forget and periodic background work.
///
/// Every task observes a shared [`CancellationToken`]; [`shutdown`](Self::shutdown)
/// cancels it and waits for all tracked tasks to finish. Clones share the
/// same tracker and token.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TaskExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a one-shot task. It is dropped at its next await point once the
    /// executor shuts down.
    pub fn submit<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(task = name, "executor shut down, task rejected");
            return;
        }
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = token.cancelled() => debug!(task = name, "task cancelled"),
                () = task => {}
            }
        });
    }

    /// Run `task` every `period`, first after `initial_delay`. Missed ticks
    /// are skipped; a run never overlaps the previous one.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(task = name, "executor shut down, schedule rejected");
            return;
        }
        let token = self.token.clone();
        self.tracker.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!(task = name, "periodic task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = task() => {}
                        }
                    }
                }
            }
        });
    }

    /// Token cancelled when the executor shuts down.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("background executor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn submitted_task_runs() {
        let executor = TaskExecutor::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.submit("probe", async move {
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
        executor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_task_repeats_until_shutdown() {
        let executor = TaskExecutor::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        executor.schedule_at_fixed_rate(
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

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        executor.shutdown().await;
        let after = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_tasks_and_rejects_new_ones() {
        let executor = TaskExecutor::new();
        executor.submit("forever", std::future::pending());
        executor.shutdown().await;
        assert!(executor.is_shutdown());

        let ran = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&ran);
        executor.submit("late", async move {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
