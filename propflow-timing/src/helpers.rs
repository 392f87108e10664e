//! Ready-made hit tasks for the common coalescing shapes

use crate::hit_task::{Coalesce, HitGate, HitOptions, HitTask};
use crate::scheduler::{Delay, SchedulerRef};
use std::time::Duration;

/// Last call within `wait` wins
pub fn debounce<A, F>(scheduler: SchedulerRef, wait: Duration, f: F) -> HitTask<A>
where
    A: Clone + Send + 'static,
    F: Fn(A) + Send + Sync + 'static,
{
    HitTask::with_handler(
        scheduler,
        HitOptions::deferred(Delay::After(wait), Coalesce::Debounce),
        f,
    )
}

/// At most one run per `wait`; calls arriving while one is pending are dropped
pub fn throttle<A, F>(scheduler: SchedulerRef, wait: Duration, f: F) -> HitTask<A>
where
    A: Clone + Send + 'static,
    F: Fn(A) + Send + Sync + 'static,
{
    HitTask::with_handler(
        scheduler,
        HitOptions::deferred(Delay::After(wait), Coalesce::Mono),
        f,
    )
}

/// The first call of a synchronous burst wins and runs on the next tick
pub fn mono<A, F>(scheduler: SchedulerRef, f: F) -> HitTask<A>
where
    A: Clone + Send + 'static,
    F: Fn(A) + Send + Sync + 'static,
{
    HitTask::with_handler(scheduler, HitOptions::deferred(Delay::Tick, Coalesce::Mono), f)
}

/// Runs only when the number of calls counted since the last run lies in
/// `[min, max]`; the count restarts once `span` has passed since that run
/// (double-click style detection)
pub fn multi_hit<A, F>(
    scheduler: SchedulerRef,
    min: u32,
    max: u32,
    span: Duration,
    f: F,
) -> HitTask<A>
where
    A: Clone + Send + 'static,
    F: Fn(A) + Send + Sync + 'static,
{
    HitTask::with_handler(
        scheduler,
        HitOptions::immediate().with_hits(HitGate::new(min, max, span)),
        f,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::ManualScheduler;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_debounce_collapses_burst() {
        let scheduler = ManualScheduler::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let task = debounce(scheduler.shared(), Duration::from_millis(50), move |v: u32| {
            seen_clone.lock().unwrap().push(v)
        });

        for i in 0..10 {
            task.process(i);
            scheduler.advance(Duration::from_millis(1));
        }
        scheduler.advance(Duration::from_millis(100));

        assert_eq!(*seen.lock().unwrap(), vec![9]);
    }

    #[test]
    fn test_throttle_keeps_first_in_window() {
        let scheduler = ManualScheduler::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let task = throttle(scheduler.shared(), Duration::from_millis(20), move |v: u32| {
            seen_clone.lock().unwrap().push(v)
        });

        task.process(1);
        task.process(2);
        scheduler.advance(Duration::from_millis(20));
        task.process(3);
        task.process(4);
        scheduler.advance(Duration::from_millis(20));

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_mono_runs_on_next_tick() {
        let scheduler = ManualScheduler::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let task = mono(scheduler.shared(), move |v: &'static str| {
            seen_clone.lock().unwrap().push(v)
        });

        task.process("a");
        task.process("b");
        assert!(seen.lock().unwrap().is_empty());

        scheduler.flush();
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_multi_hit_triple_click() {
        let scheduler = ManualScheduler::new();
        let seen = Arc::new(Mutex::new(0));
        let seen_clone = seen.clone();
        let task = multi_hit(
            scheduler.shared(),
            3,
            3,
            Duration::from_millis(300),
            move |_: ()| *seen_clone.lock().unwrap() += 1,
        );

        task.process(());
        scheduler.advance(Duration::from_millis(100));
        task.process(());
        scheduler.advance(Duration::from_millis(100));
        task.process(());

        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
