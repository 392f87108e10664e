//! Listener options and per-fire metadata

use propflow_timing::{Coalesce, Delay, HitOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Metadata travelling with a single `fire` call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FireMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addition: Option<Value>,
}

impl FireMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_addition(mut self, addition: Value) -> Self {
        self.addition = Some(addition);
        self
    }
}

impl From<&str> for FireMeta {
    fn from(message: &str) -> Self {
        FireMeta::new().with_message(message)
    }
}

impl From<String> for FireMeta {
    fn from(message: String) -> Self {
        FireMeta::new().with_message(message)
    }
}

/// Predicate deciding per fire whether a listener is done
pub type InvalidPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// When a listener disposes itself automatically
pub enum Invalidation<E> {
    /// Lives until disposed explicitly
    Never,
    /// Disposed after its first delivery
    AfterFirst,
    /// Disposed once it has been delivered this many events
    AfterFires(u64),
    /// Asked with each event; `true` disposes the listener
    When(InvalidPredicate<E>),
}

impl<E> Invalidation<E> {
    pub fn when(predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Invalidation::When(Arc::new(predicate))
    }
}

impl<E> Default for Invalidation<E> {
    fn default() -> Self {
        Invalidation::Never
    }
}

impl<E> Clone for Invalidation<E> {
    fn clone(&self) -> Self {
        match self {
            Invalidation::Never => Invalidation::Never,
            Invalidation::AfterFirst => Invalidation::AfterFirst,
            Invalidation::AfterFires(n) => Invalidation::AfterFires(*n),
            Invalidation::When(p) => Invalidation::When(Arc::clone(p)),
        }
    }
}

impl<E> fmt::Debug for Invalidation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidation::Never => write!(f, "Never"),
            Invalidation::AfterFirst => write!(f, "AfterFirst"),
            Invalidation::AfterFires(n) => write!(f, "AfterFires({n})"),
            Invalidation::When(_) => write!(f, "When(<predicate>)"),
        }
    }
}

/// Options for registering a listener
pub struct ListenOptions<E> {
    /// Delivery timing, see [`Delay`]
    pub delay: Delay,
    /// How deferred deliveries coalesce
    pub policy: Coalesce,
    /// Ceiling on deliveries; the listener stays registered but inert
    pub max_fires: Option<u64>,
    /// Automatic disposal policy
    pub invalid: Invalidation<E>,
    /// A listener invalidated by its predicate still receives the event
    /// that invalidated it
    pub invalid_for_next_time: bool,
    /// Arbitrary value handed back to the handler through its context
    pub arg: Option<Value>,
}

impl<E> Default for ListenOptions<E> {
    fn default() -> Self {
        Self {
            delay: Delay::Immediate,
            policy: Coalesce::default(),
            max_fires: None,
            invalid: Invalidation::Never,
            invalid_for_next_time: false,
            arg: None,
        }
    }
}

impl<E> Clone for ListenOptions<E> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            policy: self.policy,
            max_fires: self.max_fires,
            invalid: self.invalid.clone(),
            invalid_for_next_time: self.invalid_for_next_time,
            arg: self.arg.clone(),
        }
    }
}

impl<E> fmt::Debug for ListenOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("delay", &self.delay)
            .field("policy", &self.policy)
            .field("max_fires", &self.max_fires)
            .field("invalid", &self.invalid)
            .field("invalid_for_next_time", &self.invalid_for_next_time)
            .field("arg", &self.arg)
            .finish()
    }
}

impl<E> ListenOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispose after the first delivery
    pub fn once() -> Self {
        Self::new().invalid(Invalidation::AfterFires(1))
    }

    pub fn delay(mut self, delay: impl Into<Delay>) -> Self {
        self.delay = delay.into();
        self
    }

    pub fn policy(mut self, policy: Coalesce) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_fires(mut self, max: u64) -> Self {
        self.max_fires = Some(max);
        self
    }

    pub fn invalid(mut self, invalid: Invalidation<E>) -> Self {
        self.invalid = invalid;
        self
    }

    pub fn invalid_for_next_time(mut self, keep_current: bool) -> Self {
        self.invalid_for_next_time = keep_current;
        self
    }

    pub fn arg(mut self, arg: Value) -> Self {
        self.arg = Some(arg);
        self
    }

    pub(crate) fn hit_options(&self) -> HitOptions {
        HitOptions {
            delay: self.delay,
            policy: self.policy,
            hits: None,
            max_fires: self.max_fires,
        }
    }
}
