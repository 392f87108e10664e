//! Once-settlement futures
//!
//! A [`Settlement`] is a single-assignment outcome holder. Code that runs
//! before the outcome is known registers callbacks; whoever settles it first
//! decides the outcome and every later settle call is a no-op.
//!
//! # Invariants
//!
//! 1. State moves `Pending -> Resolved` or `Pending -> Rejected`, never back.
//! 2. Callbacks registered for the losing outcome are dropped uncalled.
//! 3. A callback registered after settlement runs if (and only if) it
//!    matches the outcome, inline or one scheduler tick later when the
//!    settlement defers late callbacks.

use crate::scheduler::{Delay, SchedulerRef};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Callback<V> = Box<dyn FnOnce(V) + Send + 'static>;

struct Waiter<V> {
    delay: Delay,
    callback: Callback<V>,
}

enum Outcome<T, E> {
    Pending,
    Resolved(T),
    Rejected(E),
}

struct SettleState<T, E> {
    outcome: Outcome<T, E>,
    on_resolved: Vec<Waiter<T>>,
    on_rejected: Vec<Waiter<E>>,
}

struct SettleInner<T, E> {
    scheduler: SchedulerRef,
    defer_late: bool,
    state: Mutex<SettleState<T, E>>,
}

/// Single-assignment resolve/reject outcome holder
///
/// Cloning shares the same outcome.
pub struct Settlement<T, E> {
    inner: Arc<SettleInner<T, E>>,
}

impl<T, E> Clone for Settlement<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for Settlement<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        let outcome = match state.outcome {
            Outcome::Pending => "pending",
            Outcome::Resolved(_) => "resolved",
            Outcome::Rejected(_) => "rejected",
        };
        f.debug_struct("Settlement")
            .field("outcome", &outcome)
            .field("on_resolved", &state.on_resolved.len())
            .field("on_rejected", &state.on_rejected.len())
            .finish()
    }
}

impl<T, E> Settlement<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a pending settlement; late callbacks run inline
    pub fn new(scheduler: SchedulerRef) -> Self {
        Self::with_options(scheduler, false)
    }

    /// Create a pending settlement, optionally deferring late callbacks by
    /// one scheduler tick
    pub fn with_options(scheduler: SchedulerRef, defer_late: bool) -> Self {
        Self {
            inner: Arc::new(SettleInner {
                scheduler,
                defer_late,
                state: Mutex::new(SettleState {
                    outcome: Outcome::Pending,
                    on_resolved: Vec::new(),
                    on_rejected: Vec::new(),
                }),
            }),
        }
    }

    /// A settlement that is already resolved
    pub fn resolved(scheduler: SchedulerRef, value: T) -> Self {
        let settlement = Self::new(scheduler);
        settlement.resolve(value);
        settlement
    }

    /// A settlement that is already rejected
    pub fn rejected(scheduler: SchedulerRef, error: E) -> Self {
        let settlement = Self::new(scheduler);
        settlement.reject(error);
        settlement
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Outcome::Pending)
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Outcome::Resolved(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Outcome::Rejected(_))
    }

    /// Snapshot of the outcome, `None` while pending
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &self.inner.state.lock().outcome {
            Outcome::Pending => None,
            Outcome::Resolved(v) => Some(Ok(v.clone())),
            Outcome::Rejected(e) => Some(Err(e.clone())),
        }
    }

    /// Settle successfully. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            if !matches!(state.outcome, Outcome::Pending) {
                return false;
            }
            state.outcome = Outcome::Resolved(value.clone());
            state.on_rejected.clear();
            std::mem::take(&mut state.on_resolved)
        };
        for waiter in waiters {
            self.deliver(waiter.delay, waiter.callback, value.clone());
        }
        true
    }

    /// Settle as failed. Returns `false` if already settled.
    pub fn reject(&self, error: E) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            if !matches!(state.outcome, Outcome::Pending) {
                return false;
            }
            state.outcome = Outcome::Rejected(error.clone());
            state.on_resolved.clear();
            std::mem::take(&mut state.on_rejected)
        };
        for waiter in waiters {
            self.deliver(waiter.delay, waiter.callback, error.clone());
        }
        true
    }

    pub fn on_resolved(&self, callback: impl FnOnce(T) + Send + 'static) -> &Self {
        self.on_resolved_after(Delay::Immediate, callback)
    }

    pub fn on_rejected(&self, callback: impl FnOnce(E) + Send + 'static) -> &Self {
        self.on_rejected_after(Delay::Immediate, callback)
    }

    /// Register a success callback delivered through `delay`
    pub fn on_resolved_after(
        &self,
        delay: Delay,
        callback: impl FnOnce(T) + Send + 'static,
    ) -> &Self {
        let late = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Outcome::Pending => {
                    state.on_resolved.push(Waiter {
                        delay,
                        callback: Box::new(callback),
                    });
                    return self;
                }
                Outcome::Resolved(v) => Some((v.clone(), callback)),
                Outcome::Rejected(_) => None,
            }
        };
        if let Some((value, callback)) = late {
            self.deliver(self.late_delay(delay), Box::new(callback), value);
        }
        self
    }

    /// Register a failure callback delivered through `delay`
    pub fn on_rejected_after(
        &self,
        delay: Delay,
        callback: impl FnOnce(E) + Send + 'static,
    ) -> &Self {
        let late = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Outcome::Pending => {
                    state.on_rejected.push(Waiter {
                        delay,
                        callback: Box::new(callback),
                    });
                    return self;
                }
                Outcome::Rejected(e) => Some((e.clone(), callback)),
                Outcome::Resolved(_) => None,
            }
        };
        if let Some((error, callback)) = late {
            self.deliver(self.late_delay(delay), Box::new(callback), error);
        }
        self
    }

    /// Chain a transformation of the success value
    pub fn then<U>(&self, f: impl FnOnce(T) -> U + Send + 'static) -> Settlement<U, E>
    where
        U: Clone + Send + 'static,
    {
        let next = Settlement::with_options(self.inner.scheduler.clone(), self.inner.defer_late);
        let on_ok = next.clone();
        let on_err = next.clone();
        self.on_resolved(move |v| {
            on_ok.resolve(f(v));
        });
        self.on_rejected(move |e| {
            on_err.reject(e);
        });
        next
    }

    /// Chain a recovery from failure
    pub fn catch(&self, f: impl FnOnce(E) -> T + Send + 'static) -> Settlement<T, E> {
        let next = Settlement::with_options(self.inner.scheduler.clone(), self.inner.defer_late);
        let on_ok = next.clone();
        let on_err = next.clone();
        self.on_resolved(move |v| {
            on_ok.resolve(v);
        });
        self.on_rejected(move |e| {
            on_err.resolve(f(e));
        });
        next
    }

    /// Wait for the outcome from async code.
    ///
    /// Returns `None` if every handle able to settle was dropped first.
    pub async fn wait(&self) -> Option<Result<T, E>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_err = tx.clone();
        self.on_resolved(move |v| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(Ok(v));
            }
        });
        self.on_rejected(move |e| {
            if let Some(tx) = tx_err.lock().take() {
                let _ = tx.send(Err(e));
            }
        });
        rx.await.ok()
    }

    fn late_delay(&self, requested: Delay) -> Delay {
        if self.inner.defer_late && requested == Delay::Immediate {
            Delay::Tick
        } else {
            requested
        }
    }

    fn deliver<V: Send + 'static>(&self, delay: Delay, callback: Callback<V>, value: V) {
        match delay.duration() {
            None => callback(value),
            Some(d) => {
                self.inner
                    .scheduler
                    .schedule(d, Box::new(move || callback(value)));
            }
        }
    }
}
