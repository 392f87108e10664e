//! Fixed-period recurring callbacks

use crate::scheduler::{SchedulerRef, TimerHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Why a scheduled callback ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleSource {
    Start,
    Restart,
    Plan,
    Replan,
    Resume,
    Schedule,
    Immediate,
}

/// Lifecycle of a [`Schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleState {
    Stopped,
    Running,
    Paused,
}

type ScheduleCallback = Arc<dyn Fn(ScheduleSource) + Send + Sync>;

struct ScheduleData {
    state: ScheduleState,
    pending: Option<(u64, TimerHandle)>,
    generation: u64,
    runs: u64,
}

struct ScheduleInner {
    scheduler: SchedulerRef,
    period: Duration,
    callback: ScheduleCallback,
    data: Mutex<ScheduleData>,
}

/// A recurring callback with start / pause / resume / stop transitions
///
/// Every tick that happens while the schedule is running re-arms the next
/// tick one `period` later. The callback receives the [`ScheduleSource`]
/// that caused the tick.
#[derive(Clone)]
pub struct Schedule {
    inner: Arc<ScheduleInner>,
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.data.lock();
        f.debug_struct("Schedule")
            .field("period", &self.inner.period)
            .field("state", &data.state)
            .field("pending", &data.pending.is_some())
            .field("runs", &data.runs)
            .finish()
    }
}

impl Schedule {
    /// Create a stopped schedule
    pub fn new(
        scheduler: SchedulerRef,
        period: Duration,
        callback: impl Fn(ScheduleSource) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(ScheduleInner {
                scheduler,
                period,
                callback: Arc::new(callback),
                data: Mutex::new(ScheduleData {
                    state: ScheduleState::Stopped,
                    pending: None,
                    generation: 0,
                    runs: 0,
                }),
            }),
        }
    }

    pub fn state(&self) -> ScheduleState {
        self.inner.data.lock().state
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Number of times the callback ran
    pub fn runs(&self) -> u64 {
        self.inner.data.lock().runs
    }

    /// A tick is armed
    pub fn is_pending(&self) -> bool {
        self.inner.data.lock().pending.is_some()
    }

    pub fn start(&self) {
        let mut data = self.inner.data.lock();
        if data.state != ScheduleState::Stopped {
            return;
        }
        data.state = ScheduleState::Running;
        self.arm(&mut data, ScheduleSource::Start, self.inner.period);
    }

    pub fn restart(&self) {
        let mut data = self.inner.data.lock();
        data.state = ScheduleState::Running;
        self.arm(&mut data, ScheduleSource::Restart, self.inner.period);
    }

    /// Arm a one-off tick after `delay` unless a tick is already armed
    pub fn plan(&self, delay: Duration) {
        let mut data = self.inner.data.lock();
        if data.pending.is_some() {
            return;
        }
        self.arm(&mut data, ScheduleSource::Plan, delay);
    }

    /// Replace whatever tick is armed with one after `delay`
    pub fn replan(&self, delay: Duration) {
        let mut data = self.inner.data.lock();
        self.arm(&mut data, ScheduleSource::Replan, delay);
    }

    pub fn pause(&self) {
        let mut data = self.inner.data.lock();
        if data.state != ScheduleState::Running {
            return;
        }
        data.state = ScheduleState::Paused;
        Self::disarm(&mut data);
    }

    pub fn resume(&self) {
        let mut data = self.inner.data.lock();
        if data.state != ScheduleState::Paused {
            return;
        }
        data.state = ScheduleState::Running;
        self.arm(&mut data, ScheduleSource::Resume, self.inner.period);
    }

    /// Run the callback now; a running schedule re-arms a full period later
    pub fn immediate(&self) {
        {
            let mut data = self.inner.data.lock();
            Self::disarm(&mut data);
            if data.state == ScheduleState::Running {
                self.arm(&mut data, ScheduleSource::Schedule, self.inner.period);
            }
            data.runs += 1;
        }
        (self.inner.callback)(ScheduleSource::Immediate);
    }

    pub fn stop(&self) {
        let mut data = self.inner.data.lock();
        data.state = ScheduleState::Stopped;
        Self::disarm(&mut data);
    }

    fn disarm(data: &mut ScheduleData) {
        if let Some((_, timer)) = data.pending.take() {
            timer.cancel();
        }
    }

    fn arm(&self, data: &mut ScheduleData, source: ScheduleSource, delay: Duration) {
        Self::disarm(data);
        data.generation += 1;
        let generation = data.generation;
        let weak: Weak<ScheduleInner> = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Schedule { inner }.tick(generation, source);
                }
            }),
        );
        data.pending = Some((generation, timer));
    }

    fn tick(&self, generation: u64, source: ScheduleSource) {
        {
            let mut data = self.inner.data.lock();
            match data.pending {
                Some((armed, _)) if armed == generation => data.pending = None,
                _ => return,
            }
            if data.state == ScheduleState::Running {
                self.arm(&mut data, ScheduleSource::Schedule, self.inner.period);
            }
            data.runs += 1;
        }
        tracing::trace!(?source, "schedule tick");
        (self.inner.callback)(source);
    }
}
