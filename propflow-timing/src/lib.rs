//! Propflow timing primitives
//!
//! This crate holds everything in propflow that decides *when* work runs:
//!
//! - [`Scheduler`]: the clock-and-timer abstraction every deferred callback
//!   goes through, with a deterministic [`ManualScheduler`] and a
//!   [`TokioScheduler`] implementation.
//! - [`HitTask`]: the coalescing unit behind debounced event delivery and
//!   the public [`debounce`], [`throttle`], [`mono`] and [`multi_hit`]
//!   helpers.
//! - [`Schedule`]: fixed-period recurring callbacks.
//! - [`Settlement`]: a once-settlement future used to report the eventual
//!   outcome of a proposed change.
//!
//! # Execution model
//!
//! There is a single logical thread of control. Deferred work never blocks;
//! it is a timer of zero or more ticks registered with the scheduler. All
//! components release their internal locks before invoking user callbacks,
//! so callbacks may freely re-enter the component that invoked them.
//!
//! # Example
//!
//! ```rust
//! use propflow_timing::{debounce, ManualScheduler};
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! let scheduler = ManualScheduler::new();
//! let last = Arc::new(Mutex::new(None));
//! let sink = last.clone();
//! let task = debounce(scheduler.shared(), Duration::from_millis(50), move |v: u32| {
//!     *sink.lock().unwrap() = Some(v);
//! });
//!
//! for i in 0..10 {
//!     task.process(i);
//! }
//! scheduler.advance(Duration::from_millis(50));
//! assert_eq!(*last.lock().unwrap(), Some(9));
//! ```

pub mod helpers;
pub mod hit_task;
pub mod manual;
pub mod schedule;
pub mod scheduler;
pub mod settlement;
pub mod tokio_scheduler;

pub use helpers::{debounce, mono, multi_hit, throttle};
pub use hit_task::{Coalesce, HitGate, HitHandler, HitOptions, HitTask};
pub use manual::ManualScheduler;
pub use schedule::{Schedule, ScheduleSource, ScheduleState};
pub use scheduler::{run_with_delay, Delay, Scheduler, SchedulerRef, Task, TimerHandle};
pub use settlement::Settlement;
pub use tokio_scheduler::TokioScheduler;
