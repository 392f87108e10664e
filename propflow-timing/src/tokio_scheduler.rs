//! Scheduler backed by a tokio runtime

use crate::scheduler::{Scheduler, Task, TimerHandle};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::runtime::Handle;

/// Runs each timer as a spawned tokio task
///
/// `now()` is derived from tokio's clock, so tests running with paused
/// time observe virtual timestamps that match their timers.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: Handle,
    wall_start: DateTime<Utc>,
    clock_start: tokio::time::Instant,
}

impl TokioScheduler {
    /// Bind to the runtime the caller is currently running on.
    ///
    /// Returns `None` outside of a tokio runtime context.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::with_handle)
    }

    /// Bind to an explicit runtime handle
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            wall_start: Utc::now(),
            clock_start: tokio::time::Instant::now(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.clock_start.elapsed();
        self.wall_start
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let timer = handle.clone();
        self.runtime.spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            if timer.begin_run() {
                task();
            } else {
                tracing::trace!(timer = timer.id(), "timer cancelled before firing");
            }
        });
        handle
    }
}
