//! Tracked task scheduling: deferred work, periodic work and graceful shutdown
//!
//! Every task goes through one [`TaskTracker`], so shutdown can wait for all
//! of them. Two tokens drive cancellation:
//! - the shutdown token stops pending delays and periodic loops
//! - the force token is cancelled once the grace period is over; long-running
//!   work (handler invocations) watches it and aborts

use crate::error::RelayError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long aborted tasks get to unwind after the grace period
const FORCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Scheduler {
    tracker: TaskTracker,
    shutdown: CancellationToken,
    force: CancellationToken,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    /// Spawn a tracked task
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Run `task` after `delay` unless shutdown starts first
    ///
    /// Returns false (and drops `task`) when the scheduler is already shut down.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return false;
        }

        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
        true
    }

    /// Run `make_task()` every `period`, first after one full period
    ///
    /// Each run is its own task: an error or a panic is logged, reported to
    /// `on_failure`, and the next tick still happens. Runs never overlap.
    pub fn schedule_at_fixed_rate<M, Fut, E>(
        &self,
        name: &'static str,
        period: Duration,
        make_task: M,
        on_failure: E,
    ) where
        M: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
        E: Fn(&RelayError) + Send + Sync + 'static,
    {
        let shutdown = self.shutdown.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let outcome = match tracker.spawn(make_task()).await {
                    Ok(result) => result,
                    Err(join_err) => Err(RelayError::Other(format!(
                        "periodic task '{}' panicked: {}",
                        name,
                        panic_message(join_err)
                    ))),
                };

                if let Err(err) = outcome {
                    tracing::warn!(task = name, error = %err, "a3s.relay.scheduler: periodic task failed");
                    on_failure(&err);
                }
            }

            tracing::debug!(task = name, "a3s.relay.scheduler: periodic task stopped");
        });
    }

    /// Cancelled once shutdown starts
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancelled once the shutdown grace period is exhausted
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of tracked tasks still alive
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Stop scheduling, wait up to `grace` for tracked tasks, then force-cancel the rest
    ///
    /// Returns true if everything finished within the grace period. Safe to
    /// call more than once.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return true;
        }

        tracing::warn!(
            remaining = self.tracker.len(),
            grace_ms = grace.as_millis() as u64,
            "a3s.relay.scheduler: grace period exhausted, aborting remaining tasks"
        );
        self.force.cancel();

        if tokio::time::timeout(FORCE_DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tracker.len(),
                "a3s.relay.scheduler: tasks still running after abort"
            );
        }
        false
    }
}

/// Best-effort text of a task panic
pub(crate) fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_schedule_after_runs_after_delay() {
        let scheduler = Scheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let started = std::time::Instant::now();

        assert!(scheduler.schedule_after(Duration::from_millis(30), async move {
            let _ = tx.send(());
        }));

        rx.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_schedule_after_zero_delay() {
        let scheduler = Scheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.schedule_after(Duration::ZERO, async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_delays() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        scheduler.schedule_after(Duration::from_secs(60), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.active_tasks(), 1);

        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_is_rejected() {
        let scheduler = Scheduler::new();
        scheduler.shutdown(Duration::from_millis(10)).await;

        assert!(!scheduler.schedule_after(Duration::ZERO, async {}));
        assert!(scheduler.is_shutdown());
    }

    #[tokio::test]
    async fn test_fixed_rate_keeps_running_after_failures() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let run_counter = Arc::clone(&runs);
        let failure_counter = Arc::clone(&failures);
        scheduler.schedule_at_fixed_rate(
            "flaky",
            Duration::from_millis(10),
            move || {
                let run = run_counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match run {
                        0 => Err(RelayError::Other("first run fails".to_string())),
                        1 => panic!("second run panics"),
                        _ => Ok(()),
                    }
                }
            },
            move |_| {
                failure_counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(runs.load(Ordering::SeqCst) >= 4);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_fixed_rate_waits_one_period_first() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        scheduler.schedule_at_fixed_rate(
            "slow",
            Duration::from_secs(3600),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_forces_stuck_tasks() {
        let scheduler = Scheduler::new();
        let force = scheduler.force_token();
        scheduler.spawn(async move {
            force.cancelled().await;
        });

        let started = std::time::Instant::now();
        assert!(!scheduler.shutdown(Duration::from_millis(30)).await);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let scheduler = Scheduler::new();
        assert!(scheduler.shutdown(Duration::from_millis(10)).await);
        assert!(scheduler.shutdown(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_panic_message() {
        let err = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        assert_eq!(panic_message(err), "boom");

        let err = tokio::spawn(async { panic!("code {}", 7) }).await.unwrap_err();
        assert_eq!(panic_message(err), "code 7");
    }
}
