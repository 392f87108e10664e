//! Scheduler abstraction shared by every deferred callback in propflow
//!
//! All suspension points in the system (debounced delivery, delayed
//! settlement callbacks, recurring schedules) go through a [`Scheduler`].
//! The scheduler also owns the notion of "now" so that timestamps stay
//! consistent with the timers that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit of deferred work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared scheduler reference handed to every component
pub type SchedulerRef = Arc<dyn Scheduler>;

/// Source of time and deferred execution
///
/// Implementations must never run a task whose [`TimerHandle`] has been
/// cancelled, and must never run a task synchronously from inside
/// [`Scheduler::schedule`].
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Current instant according to this scheduler
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once `delay` has elapsed
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// When a piece of work should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delay {
    /// Run synchronously, right now
    #[default]
    Immediate,
    /// Run on the next scheduler tick (a zero-duration timer)
    Tick,
    /// Run after the given duration
    After(Duration),
}

impl Delay {
    /// Build a delay from milliseconds; zero maps to [`Delay::Tick`]
    pub fn millis(ms: u64) -> Self {
        if ms == 0 {
            Delay::Tick
        } else {
            Delay::After(Duration::from_millis(ms))
        }
    }

    /// Whether this delay goes through the scheduler at all
    pub fn is_deferred(&self) -> bool {
        !matches!(self, Delay::Immediate)
    }

    /// Duration to hand to the scheduler, `None` for immediate execution
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Delay::Immediate => None,
            Delay::Tick => Some(Duration::ZERO),
            Delay::After(d) => Some(*d),
        }
    }
}

impl From<Duration> for Delay {
    fn from(d: Duration) -> Self {
        Delay::After(d)
    }
}

impl From<bool> for Delay {
    fn from(deferred: bool) -> Self {
        if deferred {
            Delay::Tick
        } else {
            Delay::Immediate
        }
    }
}

static TIMER_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TimerState {
    id: u64,
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Handle to a scheduled task
///
/// Cloning shares the same underlying timer. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    /// Create a handle for a freshly scheduled timer
    pub fn new() -> Self {
        Self {
            state: Arc::new(TimerState {
                id: TIMER_COUNTER.fetch_add(1, Ordering::SeqCst),
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Unique id of this timer
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Prevent the task from running; no-op once it already ran
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the task already ran
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    /// Still waiting to run
    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && !self.is_finished()
    }

    /// Claim the right to run the task.
    ///
    /// Returns `false` when the timer was cancelled or already claimed.
    /// Scheduler implementations call this right before invoking the task.
    pub fn begin_run(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        !self.state.finished.swap(true, Ordering::SeqCst)
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.state.id == other.state.id
    }
}

impl Eq for TimerHandle {}

/// Run `task` according to `delay`: inline for [`Delay::Immediate`],
/// otherwise through the scheduler.
///
/// Returns the timer handle when the task was deferred.
pub fn run_with_delay(scheduler: &dyn Scheduler, delay: Delay, task: Task) -> Option<TimerHandle> {
    match delay.duration() {
        None => {
            task();
            None
        }
        Some(d) => Some(scheduler.schedule(d, task)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_from_millis() {
        assert_eq!(Delay::millis(0), Delay::Tick);
        assert_eq!(Delay::millis(5), Delay::After(Duration::from_millis(5)));
        assert!(!Delay::Immediate.is_deferred());
        assert_eq!(Delay::Tick.duration(), Some(Duration::ZERO));
    }

    #[test]
    fn test_delay_from_bool() {
        assert_eq!(Delay::from(true), Delay::Tick);
        assert_eq!(Delay::from(false), Delay::Immediate);
    }

    #[test]
    fn test_timer_handle_claims_once() {
        let handle = TimerHandle::new();
        assert!(handle.is_pending());
        assert!(handle.begin_run());
        assert!(!handle.begin_run());
        assert!(handle.is_finished());
    }

    #[test]
    fn test_cancelled_timer_cannot_run() {
        let handle = TimerHandle::new();
        handle.cancel();
        handle.cancel();
        assert!(!handle.is_pending());
        assert!(!handle.begin_run());
    }
}
