//! Hit tasks: decide when and whether work runs under rapid repeated triggers
//!
//! A [`HitTask`] wraps a list of handlers behind a coalescing policy. Every
//! call to [`HitTask::process`] is a "hit"; the task's options decide whether
//! the hit runs the handlers now, later, or not at all.
//!
//! # Policies
//!
//! - [`Delay::Immediate`]: run synchronously inside `process`.
//! - Deferred delays combined with a [`Coalesce`] policy:
//!   - `Debounce`: a new hit replaces the pending one (last call wins)
//!   - `Mono`: hits are ignored while one is pending (first call wins)
//!   - `None`: every hit gets its own timer
//! - [`HitGate`]: only hits whose rolling count lies in `[min, max]` pass.
//! - `max_fires`: total ceiling after which the task never runs again.
//!
//! None of these operations can fail. Nonsensical bounds simply mean the
//! handlers never run.

use crate::scheduler::{Delay, SchedulerRef, TimerHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Handler invoked when a hit task fires
pub type HitHandler<A> = Arc<dyn Fn(A) + Send + Sync>;

/// How deferred hits coalesce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coalesce {
    /// Last call wins
    #[default]
    Debounce,
    /// First call wins
    Mono,
    /// No coalescing
    None,
}

/// Hit-count gating bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitGate {
    /// Smallest hit count that fires
    pub min: u32,
    /// Largest hit count that fires
    pub max: u32,
    /// A hit arriving more than this long after the last fire starts a new
    /// count. Before the first fire the count's first hit stands in for it.
    pub span: Duration,
}

impl HitGate {
    pub fn new(min: u32, max: u32, span: Duration) -> Self {
        Self { min, max, span }
    }

    fn admits(&self, count: u32) -> bool {
        self.max > 0 && self.min <= self.max && count >= self.min && count <= self.max
    }
}

/// Construction-time options of a [`HitTask`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HitOptions {
    #[serde(default)]
    pub delay: Delay,
    #[serde(default)]
    pub policy: Coalesce,
    #[serde(default)]
    pub hits: Option<HitGate>,
    #[serde(default)]
    pub max_fires: Option<u64>,
}

impl HitOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn deferred(delay: impl Into<Delay>, policy: Coalesce) -> Self {
        Self {
            delay: delay.into(),
            policy,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: impl Into<Delay>) -> Self {
        self.delay = delay.into();
        self
    }

    pub fn with_policy(mut self, policy: Coalesce) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hits(mut self, gate: HitGate) -> Self {
        self.hits = Some(gate);
        self
    }

    pub fn with_max_fires(mut self, max: u64) -> Self {
        self.max_fires = Some(max);
        self
    }
}

struct PendingHit<A> {
    id: u64,
    timer: TimerHandle,
    arg: A,
}

struct HitState<A> {
    handlers: Vec<HitHandler<A>>,
    pending: Vec<PendingHit<A>>,
    next_pending: u64,
    hit_count: u32,
    /// First hit of the current count
    count_started: Option<DateTime<Utc>>,
    fire_count: u64,
    last_fired: Option<DateTime<Utc>>,
    disposed: bool,
}

impl<A> HitState<A> {
    fn ceiling_reached(&self, options: &HitOptions) -> bool {
        options.max_fires.is_some_and(|max| self.fire_count >= max)
    }

    fn cancel_pending(&mut self) -> Vec<PendingHit<A>> {
        let drained: Vec<_> = self.pending.drain(..).collect();
        for hit in &drained {
            hit.timer.cancel();
        }
        drained
    }
}

struct HitInner<A> {
    scheduler: SchedulerRef,
    options: HitOptions,
    state: Mutex<HitState<A>>,
}

/// A coalescing scheduling unit
///
/// Cloning a `HitTask` creates a new handle to the **same** task.
pub struct HitTask<A> {
    inner: Arc<HitInner<A>>,
}

impl<A> Clone for HitTask<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for HitTask<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HitTask")
            .field("options", &self.inner.options)
            .field("handlers", &state.handlers.len())
            .field("pending", &state.pending.len())
            .field("fire_count", &state.fire_count)
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<A: Clone + Send + 'static> HitTask<A> {
    /// Create a task with no handlers
    pub fn new(scheduler: SchedulerRef, options: HitOptions) -> Self {
        Self {
            inner: Arc::new(HitInner {
                scheduler,
                options,
                state: Mutex::new(HitState {
                    handlers: Vec::new(),
                    pending: Vec::new(),
                    next_pending: 0,
                    hit_count: 0,
                    count_started: None,
                    fire_count: 0,
                    last_fired: None,
                    disposed: false,
                }),
            }),
        }
    }

    /// Create a task with a single handler
    pub fn with_handler(
        scheduler: SchedulerRef,
        options: HitOptions,
        handler: impl Fn(A) + Send + Sync + 'static,
    ) -> Self {
        let task = Self::new(scheduler, options);
        task.add_handler(handler);
        task
    }

    /// Append a handler; handlers run in insertion order
    pub fn add_handler(&self, handler: impl Fn(A) + Send + Sync + 'static) {
        self.inner.state.lock().handlers.push(Arc::new(handler));
    }

    pub fn options(&self) -> &HitOptions {
        &self.inner.options
    }

    /// Register a hit
    pub fn process(&self, arg: A) {
        let options = self.inner.options;
        let mut state = self.inner.state.lock();
        if state.disposed || state.ceiling_reached(&options) {
            return;
        }

        if let Some(gate) = options.hits {
            let now = self.inner.scheduler.now();
            let span =
                chrono::Duration::from_std(gate.span).unwrap_or_else(|_| chrono::Duration::MAX);
            let anchor = match (state.last_fired, state.count_started) {
                (Some(fired), Some(started)) => Some(fired.max(started)),
                (fired, started) => fired.or(started),
            };
            if anchor.map_or(true, |at| now - at > span) {
                state.hit_count = 0;
                state.count_started = Some(now);
            }
            state.hit_count = state.hit_count.saturating_add(1);
            if !gate.admits(state.hit_count) {
                return;
            }
        }

        let Some(delay) = options.delay.duration() else {
            drop(state);
            self.run(arg);
            return;
        };

        match options.policy {
            Coalesce::Debounce => {
                state.cancel_pending();
            }
            Coalesce::Mono => {
                if !state.pending.is_empty() {
                    return;
                }
            }
            Coalesce::None => {}
        }

        let id = state.next_pending;
        state.next_pending += 1;
        let weak: Weak<HitInner<A>> = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    HitTask { inner }.fire_pending(id);
                }
            }),
        );
        state.pending.push(PendingHit { id, timer, arg });
    }

    /// Cancel any pending timer and run right away
    pub fn process_now(&self, arg: A) {
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.cancel_pending();
        }
        self.run(arg);
    }

    /// Run every pending deferred hit now, in the order they were queued
    pub fn flush(&self) -> usize {
        let drained = self.inner.state.lock().cancel_pending();
        let count = drained.len();
        for hit in drained {
            self.run(hit.arg);
        }
        count
    }

    /// Cancel pending work without running it; later hits are ignored
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.cancel_pending();
        state.handlers.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// A deferred hit is waiting for its timer
    pub fn is_pending(&self) -> bool {
        !self.inner.state.lock().pending.is_empty()
    }

    /// Number of times the handlers ran
    pub fn fire_count(&self) -> u64 {
        self.inner.state.lock().fire_count
    }

    pub fn last_fired_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_fired
    }

    fn fire_pending(&self, id: u64) {
        let arg = {
            let mut state = self.inner.state.lock();
            let Some(pos) = state.pending.iter().position(|p| p.id == id) else {
                return;
            };
            state.pending.remove(pos).arg
        };
        self.run(arg);
    }

    fn run(&self, arg: A) {
        let handlers = {
            let mut state = self.inner.state.lock();
            if state.disposed || state.ceiling_reached(&self.inner.options) {
                return;
            }
            state.fire_count += 1;
            state.last_fired = Some(self.inner.scheduler.now());
            state.handlers.clone()
        };
        for handler in handlers {
            handler(arg.clone());
        }
    }
}
