//! Deterministic virtual-clock scheduler
//!
//! Nothing runs until the owner calls [`ManualScheduler::advance`] or
//! [`ManualScheduler::flush`]. This is what embedders use to drive the
//! store from their own event loop, and what every timing test uses.

use crate::scheduler::{Scheduler, Task, TimerHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

struct Queued {
    handle: TimerHandle,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    /// Virtual time elapsed since `epoch`
    elapsed: Duration,
    /// (deadline, insertion sequence) ordered min-first
    heap: BinaryHeap<Reverse<(Duration, u64)>>,
    tasks: HashMap<u64, Queued>,
    next_seq: u64,
}

/// Scheduler whose clock only moves when told to
#[derive(Clone)]
pub struct ManualScheduler {
    epoch: DateTime<Utc>,
    state: Arc<Mutex<ManualState>>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualScheduler")
            .field("epoch", &self.epoch)
            .field("elapsed", &state.elapsed)
            .field("pending", &state.tasks.len())
            .finish()
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    /// Start the virtual clock at the Unix epoch
    pub fn new() -> Self {
        Self::starting_at(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Start the virtual clock at a given instant
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            state: Arc::new(Mutex::new(ManualState::default())),
        }
    }

    /// Wrap into a shared scheduler reference
    pub fn shared(&self) -> crate::SchedulerRef {
        Arc::new(self.clone())
    }

    /// Virtual time elapsed since the clock started
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Number of timers still waiting (cancelled ones excluded)
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|q| !q.handle.is_cancelled())
            .count()
    }

    /// Deadline of the earliest live timer, relative to the clock start
    pub fn next_deadline(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        Self::pop_stale(&mut state);
        state.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Run every timer that is due right now, including zero-delay timers
    /// queued by the tasks being run.
    pub fn flush(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Move the clock forward by `by`, running due timers in deadline order.
    ///
    /// The clock is moved to each timer's deadline before it runs, so a
    /// task observing [`Scheduler::now`] sees its own deadline. Timers
    /// scheduled by running tasks are honoured if they fall in the window.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().elapsed + by;
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                Self::pop_stale(&mut state);
                let due = state.heap.peek().map(|Reverse((deadline, _))| *deadline);
                match due {
                    Some(deadline) if deadline <= target => {
                        let Some(Reverse((deadline, seq))) = state.heap.pop() else {
                            break;
                        };
                        if deadline > state.elapsed {
                            state.elapsed = deadline;
                        }
                        state.tasks.remove(&seq)
                    }
                    _ => None,
                }
            };
            let Some(queued) = next else {
                break;
            };
            if queued.handle.begin_run() {
                (queued.task)();
                ran += 1;
            }
        }
        let mut state = self.state.lock();
        if target > state.elapsed {
            state.elapsed = target;
        }
        ran
    }

    /// Drop timers that were cancelled from the top of the heap
    fn pop_stale(state: &mut ManualState) {
        while let Some(seq) = state.heap.peek().map(|Reverse((_, seq))| *seq) {
            let live = state
                .tasks
                .get(&seq)
                .is_some_and(|q| !q.handle.is_cancelled());
            if live {
                break;
            }
            state.heap.pop();
            state.tasks.remove(&seq);
        }
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.state.lock().elapsed;
        self.epoch
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let deadline = state.elapsed + delay;
        state.heap.push(Reverse((deadline, seq)));
        state.tasks.insert(
            seq,
            Queued {
                handle: handle.clone(),
                task,
            },
        );
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &'static str| -> Task {
            let log = log_clone.clone();
            Box::new(move || log.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn test_runs_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        scheduler.schedule(Duration::from_millis(20), task("late"));
        scheduler.schedule(Duration::from_millis(10), task("early"));
        scheduler.schedule(Duration::from_millis(10), task("early-2"));

        assert_eq!(scheduler.advance(Duration::from_millis(15)), 2);
        assert_eq!(*log.lock().unwrap(), vec!["early", "early-2"]);

        assert_eq!(scheduler.advance(Duration::from_millis(5)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["early", "early-2", "late"]);
    }

    #[test]
    fn test_cancelled_timer_never_runs() {
        let scheduler = ManualScheduler::new();
        let (log, task) = recorder();

        let handle = scheduler.schedule(Duration::from_millis(5), task("cancelled"));
        handle.cancel();
        assert_eq!(scheduler.pending_timers(), 0);
        assert_eq!(scheduler.advance(Duration::from_millis(10)), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_flush_runs_nested_zero_delay_tasks() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let inner_scheduler = scheduler.clone();
        let inner_log = log.clone();
        scheduler.schedule(
            Duration::ZERO,
            Box::new(move || {
                inner_log.lock().unwrap().push("outer");
                let nested_log = inner_log.clone();
                inner_scheduler.schedule(
                    Duration::ZERO,
                    Box::new(move || nested_log.lock().unwrap().push("inner")),
                );
            }),
        );

        assert_eq!(scheduler.flush(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_clock_moves_to_deadline() {
        let scheduler = ManualScheduler::new();
        let start = scheduler.now();
        let seen = Arc::new(StdMutex::new(None));

        let clock = scheduler.clone();
        let seen_clone = seen.clone();
        scheduler.schedule(
            Duration::from_millis(7),
            Box::new(move || *seen_clone.lock().unwrap() = Some(clock.now())),
        );

        scheduler.advance(Duration::from_millis(100));
        let fired_at = seen.lock().unwrap().unwrap();
        assert_eq!((fired_at - start).num_milliseconds(), 7);
        assert_eq!((scheduler.now() - start).num_milliseconds(), 100);
    }
}
