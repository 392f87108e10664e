//! Registered listeners, their delivery context and their public handle

use crate::hub::HubInner;
use crate::options::{FireMeta, Invalidation, ListenOptions};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use propflow_timing::{HitTask, SchedulerRef};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Handler invoked for each delivered event
pub type EventHandler<E> = Arc<dyn Fn(&E, &ListenerCtx<'_, E>) + Send + Sync>;

static LISTENER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Listener identifier; also the global registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl ListenerId {
    pub fn new() -> Self {
        Self(LISTENER_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener:{}", self.0)
    }
}

/// One event on its way to one listener
#[derive(Debug, Clone)]
pub(crate) struct Delivery<E> {
    pub key: String,
    pub original_key: String,
    pub event: E,
    pub meta: FireMeta,
}

pub(crate) struct Listener<E> {
    pub(crate) id: ListenerId,
    /// `None` for wildcard listeners
    pub(crate) key: Option<String>,
    handlers: Vec<EventHandler<E>>,
    invalid: Invalidation<E>,
    invalid_for_next_time: bool,
    arg: Option<Value>,
    scheduler: SchedulerRef,
    registered_at: DateTime<Utc>,
    fire_count: AtomicU64,
    last_fired: Mutex<Option<DateTime<Utc>>>,
    store: Mutex<HashMap<String, Value>>,
    disposed: AtomicBool,
    task: HitTask<Delivery<E>>,
    hub: Weak<HubInner<E>>,
}

impl<E: Clone + Send + Sync + 'static> Listener<E> {
    pub(crate) fn new(
        hub: Weak<HubInner<E>>,
        scheduler: SchedulerRef,
        key: Option<String>,
        handlers: Vec<EventHandler<E>>,
        options: ListenOptions<E>,
    ) -> Arc<Self> {
        let hit_options = options.hit_options();
        Arc::new_cyclic(|weak: &Weak<Listener<E>>| {
            let target = weak.clone();
            let task = HitTask::with_handler(scheduler.clone(), hit_options, move |delivery| {
                if let Some(listener) = target.upgrade() {
                    listener.deliver(delivery);
                }
            });
            Listener {
                id: ListenerId::new(),
                key,
                handlers,
                invalid: options.invalid,
                invalid_for_next_time: options.invalid_for_next_time,
                arg: options.arg,
                registered_at: scheduler.now(),
                scheduler,
                fire_count: AtomicU64::new(0),
                last_fired: Mutex::new(None),
                store: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
                task,
                hub,
            }
        })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Hand an event to this listener's hit task
    pub(crate) fn process(&self, delivery: Delivery<E>) {
        if !self.is_disposed() {
            self.task.process(delivery);
        }
    }

    /// Mark disposed, cancel pending deliveries and leave the hub.
    pub(crate) fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.dispose();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_listener(self.id, self.key.as_deref());
        }
    }

    /// Mark disposed without touching the hub (used by the hub itself)
    pub(crate) fn detach(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.task.dispose();
        }
    }

    fn deliver(self: Arc<Self>, delivery: Delivery<E>) {
        if self.is_disposed() {
            return;
        }

        let mut dispose_now = false;
        if let Invalidation::When(predicate) = &self.invalid {
            if predicate(&delivery.event) {
                if !self.invalid_for_next_time {
                    self.dispose();
                    return;
                }
                dispose_now = true;
            }
        }

        let count = self.fire_count.fetch_add(1, Ordering::SeqCst) + 1;
        let fired_at = self.scheduler.now();
        *self.last_fired.lock() = Some(fired_at);
        match self.invalid {
            Invalidation::AfterFirst => dispose_now = true,
            Invalidation::AfterFires(n) if count >= n => dispose_now = true,
            _ => {}
        }
        // A spent listener leaves the hub before its handlers run.
        if dispose_now {
            self.dispose();
        }

        let ctx = ListenerCtx {
            listener: &self,
            delivery: &delivery,
            fire_count: count,
            fired_at,
        };
        for handler in &self.handlers {
            handler(&delivery.event, &ctx);
        }
    }
}

/// What a handler sees about the listener it belongs to and the current
/// delivery
pub struct ListenerCtx<'a, E> {
    listener: &'a Arc<Listener<E>>,
    delivery: &'a Delivery<E>,
    fire_count: u64,
    fired_at: DateTime<Utc>,
}

impl<E: Clone + Send + Sync + 'static> ListenerCtx<'_, E> {
    /// Key the event was fired on, after key mapping
    pub fn key(&self) -> &str {
        &self.delivery.key
    }

    /// Key as the firing side named it, before key mapping
    pub fn original_key(&self) -> &str {
        &self.delivery.original_key
    }

    /// Deliveries so far, including this one
    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    pub fn fired_at(&self) -> DateTime<Utc> {
        self.fired_at
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.listener.registered_at
    }

    pub fn arg(&self) -> Option<&Value> {
        self.listener.arg.as_ref()
    }

    pub fn meta(&self) -> &FireMeta {
        &self.delivery.meta
    }

    pub fn message(&self) -> Option<&str> {
        self.delivery.meta.message.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.delivery.meta.source.as_deref()
    }

    pub fn addition(&self) -> Option<&Value> {
        self.delivery.meta.addition.as_ref()
    }

    /// Read from the listener's private store
    pub fn get(&self, name: &str) -> Option<Value> {
        self.listener.store.lock().get(name).cloned()
    }

    /// Write to the listener's private store
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.listener.store.lock().insert(name.into(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.listener.store.lock().remove(name)
    }

    /// Dispose the listener handling this event
    pub fn dispose(&self) {
        self.listener.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.listener.is_disposed()
    }

    /// Public handle to the listener
    pub fn subscription(&self) -> Subscription<E> {
        Subscription {
            listener: Arc::clone(self.listener),
        }
    }
}

/// Handle to a registered listener
///
/// Dropping the handle does not dispose the listener.
pub struct Subscription<E> {
    pub(crate) listener: Arc<Listener<E>>,
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.listener.id)
            .field("key", &self.listener.key)
            .field("fire_count", &self.listener.fire_count.load(Ordering::SeqCst))
            .field("disposed", &self.listener.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<E: Clone + Send + Sync + 'static> Subscription<E> {
    pub fn id(&self) -> ListenerId {
        self.listener.id
    }

    /// Registered key, `None` for wildcard listeners
    pub fn key(&self) -> Option<&str> {
        self.listener.key.as_deref()
    }

    /// Remove the listener. Safe to call during delivery and more than once.
    pub fn dispose(&self) {
        self.listener.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.listener.is_disposed()
    }

    pub fn fire_count(&self) -> u64 {
        self.listener.fire_count.load(Ordering::SeqCst)
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.listener.registered_at
    }

    pub fn last_fired_at(&self) -> Option<DateTime<Utc>> {
        *self.listener.last_fired.lock()
    }

    /// A delivery is waiting on this listener's coalescing timer
    pub fn is_pending(&self) -> bool {
        self.listener.task.is_pending()
    }

    /// Deliver an event to this listener only, through its own coalescing
    pub fn fire(&self, event: E, meta: FireMeta) {
        let key = self.listener.key.clone().unwrap_or_default();
        self.listener.process(Delivery {
            original_key: key.clone(),
            key,
            event,
            meta,
        });
    }

    /// Read from the listener's private store
    pub fn stored(&self, name: &str) -> Option<Value> {
        self.listener.store.lock().get(name).cloned()
    }
}
