//! Keyed publish/subscribe hub
//!
//! # Invariants
//!
//! 1. Within one `fire`, listeners are handed the event in global
//!    registration order, per-key and wildcard listeners interleaved.
//! 2. The delivery loop iterates a snapshot taken before the first
//!    handler runs. Listeners registered during dispatch do not see the
//!    event being dispatched; listeners disposed during dispatch are
//!    skipped from that point on.
//! 3. Removal from the channel lists is deferred while any dispatch is in
//!    progress and applied when the outermost dispatch returns. A
//!    zero-delay timer applies them as a backstop.

use crate::listener::{Delivery, EventHandler, Listener, ListenerCtx, ListenerId, Subscription};
use crate::options::{FireMeta, ListenOptions};
use crate::views::{MappedHub, SingleChannel};
use parking_lot::Mutex;
use propflow_timing::{SchedulerRef, TimerHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Plain disposer returned by [`EventHub::subscribe_single`]
pub type Disposer = Box<dyn FnOnce() + Send + 'static>;

struct HubState<E> {
    channels: HashMap<String, Vec<Arc<Listener<E>>>>,
    any: Vec<Arc<Listener<E>>>,
    dispatch_depth: usize,
    deferred: Vec<(ListenerId, Option<String>)>,
    backstop: Option<TimerHandle>,
}

impl<E> HubState<E> {
    fn detach_entry(&mut self, id: ListenerId, key: Option<&str>) {
        match key {
            Some(key) => {
                if let Some(list) = self.channels.get_mut(key) {
                    list.retain(|l| l.id != id);
                    if list.is_empty() {
                        self.channels.remove(key);
                    }
                }
            }
            None => self.any.retain(|l| l.id != id),
        }
    }

    fn apply_deferred(&mut self) -> usize {
        let deferred = std::mem::take(&mut self.deferred);
        let count = deferred.len();
        for (id, key) in deferred {
            self.detach_entry(id, key.as_deref());
        }
        if let Some(timer) = self.backstop.take() {
            timer.cancel();
        }
        count
    }
}

pub(crate) struct HubInner<E> {
    scheduler: SchedulerRef,
    state: Mutex<HubState<E>>,
}

impl<E: Clone + Send + Sync + 'static> HubInner<E> {
    /// Called by a listener once it has marked itself disposed
    pub(crate) fn remove_listener(self: &Arc<Self>, id: ListenerId, key: Option<&str>) {
        let mut state = self.state.lock();
        if state.dispatch_depth == 0 {
            state.detach_entry(id, key);
            return;
        }

        state.deferred.push((id, key.map(str::to_string)));
        if state.backstop.is_none() {
            let weak: Weak<HubInner<E>> = Arc::downgrade(self);
            let timer = self.scheduler.schedule(
                Duration::ZERO,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        let applied = inner.state.lock().apply_deferred();
                        if applied > 0 {
                            tracing::trace!(applied, "applied deferred listener removals");
                        }
                    }
                }),
            );
            state.backstop = Some(timer);
        }
    }

    fn dispatch(&self, key: &str, original_key: &str, event: E, meta: FireMeta) -> usize {
        if key.is_empty() {
            return 0;
        }

        let targets = {
            let mut state = self.state.lock();
            let mut targets: Vec<Arc<Listener<E>>> = state
                .channels
                .get(key)
                .into_iter()
                .flatten()
                .chain(state.any.iter())
                .filter(|l| !l.is_disposed())
                .cloned()
                .collect();
            if targets.is_empty() {
                return 0;
            }
            targets.sort_by_key(|l| l.id);
            state.dispatch_depth += 1;
            targets
        };
        let _guard = DispatchGuard { inner: self };

        tracing::trace!(key, listeners = targets.len(), "dispatching event");
        let mut delivered = 0;
        for listener in targets {
            if listener.is_disposed() {
                continue;
            }
            listener.process(Delivery {
                key: key.to_string(),
                original_key: original_key.to_string(),
                event: event.clone(),
                meta: meta.clone(),
            });
            delivered += 1;
        }
        delivered
    }
}

struct DispatchGuard<'a, E> {
    inner: &'a HubInner<E>,
}

impl<E> Drop for DispatchGuard<'_, E> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.dispatch_depth = state.dispatch_depth.saturating_sub(1);
        if state.dispatch_depth == 0 {
            state.apply_deferred();
        }
    }
}

/// Keyed event hub
///
/// Cloning creates a new handle to the same hub.
pub struct EventHub<E> {
    inner: Arc<HubInner<E>>,
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventHub")
            .field("channels", &state.channels.len())
            .field("any", &state.any.len())
            .field("dispatch_depth", &state.dispatch_depth)
            .finish()
    }
}

impl<E: Clone + Send + Sync + 'static> EventHub<E> {
    pub fn new(scheduler: SchedulerRef) -> Self {
        Self {
            inner: Arc::new(HubInner {
                scheduler,
                state: Mutex::new(HubState {
                    channels: HashMap::new(),
                    any: Vec::new(),
                    dispatch_depth: 0,
                    deferred: Vec::new(),
                    backstop: None,
                }),
            }),
        }
    }

    pub fn scheduler(&self) -> &SchedulerRef {
        &self.inner.scheduler
    }

    /// Register a handler for `key`
    pub fn on(
        &self,
        key: &str,
        handler: impl Fn(&E, &ListenerCtx<'_, E>) + Send + Sync + 'static,
        options: ListenOptions<E>,
    ) -> Subscription<E> {
        let handler: EventHandler<E> = Arc::new(handler);
        self.on_handlers(key, vec![handler], options)
    }

    /// Register several handlers sharing one listener, fire count and store
    pub fn on_handlers(
        &self,
        key: &str,
        handlers: Vec<EventHandler<E>>,
        options: ListenOptions<E>,
    ) -> Subscription<E> {
        if key.is_empty() {
            let listener = Listener::new(
                Weak::new(),
                self.inner.scheduler.clone(),
                None,
                handlers,
                options,
            );
            listener.detach();
            return Subscription { listener };
        }

        let listener = Listener::new(
            Arc::downgrade(&self.inner),
            self.inner.scheduler.clone(),
            Some(key.to_string()),
            handlers,
            options,
        );
        self.inner
            .state
            .lock()
            .channels
            .entry(key.to_string())
            .or_default()
            .push(Arc::clone(&listener));
        Subscription { listener }
    }

    /// Register a wildcard handler receiving every key; the key is available
    /// through [`ListenerCtx::key`]
    pub fn on_any(
        &self,
        handler: impl Fn(&E, &ListenerCtx<'_, E>) + Send + Sync + 'static,
        options: ListenOptions<E>,
    ) -> Subscription<E> {
        let handler: EventHandler<E> = Arc::new(handler);
        let listener = Listener::new(
            Arc::downgrade(&self.inner),
            self.inner.scheduler.clone(),
            None,
            vec![handler],
            options,
        );
        self.inner.state.lock().any.push(Arc::clone(&listener));
        Subscription { listener }
    }

    /// Register a handler that is disposed after its first delivery
    pub fn once(
        &self,
        key: &str,
        handler: impl Fn(&E, &ListenerCtx<'_, E>) + Send + Sync + 'static,
    ) -> Subscription<E> {
        self.on(key, handler, ListenOptions::once())
    }

    /// Register a converted handler and return a plain disposer
    pub fn subscribe_single<T>(
        &self,
        key: &str,
        convert: impl Fn(&E) -> T + Send + Sync + 'static,
        handler: impl Fn(T) + Send + Sync + 'static,
    ) -> Disposer {
        let subscription = self.on(
            key,
            move |event, _ctx| handler(convert(event)),
            ListenOptions::default(),
        );
        Box::new(move || subscription.dispose())
    }

    /// Fire `event` on `key`. Returns how many listeners were handed the
    /// event; firing a key nobody listens to is a no-op.
    pub fn fire(&self, key: &str, event: E, meta: impl Into<FireMeta>) -> usize {
        self.inner.dispatch(key, key, event, meta.into())
    }

    pub(crate) fn fire_mapped(
        &self,
        key: &str,
        original_key: &str,
        event: E,
        meta: FireMeta,
    ) -> usize {
        self.inner.dispatch(key, original_key, event, meta)
    }

    /// Live listeners registered under `key`, wildcard listeners excluded
    pub fn listener_count(&self, key: &str) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .get(key)
            .map_or(0, |list| list.iter().filter(|l| !l.is_disposed()).count())
    }

    pub fn any_listener_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .any
            .iter()
            .filter(|l| !l.is_disposed())
            .count()
    }

    /// Whether a fire on `key` would reach anyone
    pub fn has_listeners(&self, key: &str) -> bool {
        self.listener_count(key) > 0 || self.any_listener_count() > 0
    }

    /// Keys with at least one live listener, sorted
    pub fn keys(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut keys: Vec<String> = state
            .channels
            .iter()
            .filter(|(_, list)| list.iter().any(|l| !l.is_disposed()))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Dispose every listener registered under `key`
    pub fn clear_key(&self, key: &str) -> usize {
        let removed = self
            .inner
            .state
            .lock()
            .channels
            .remove(key)
            .unwrap_or_default();
        for listener in &removed {
            listener.detach();
        }
        removed.len()
    }

    /// Dispose every listener, wildcard ones included
    pub fn clear(&self) -> usize {
        let removed: Vec<Arc<Listener<E>>> = {
            let mut state = self.inner.state.lock();
            let any = std::mem::take(&mut state.any);
            state
                .channels
                .drain()
                .flat_map(|(_, list)| list)
                .chain(any)
                .collect()
        };
        for listener in &removed {
            listener.detach();
        }
        tracing::debug!(removed = removed.len(), "cleared event hub");
        removed.len()
    }

    /// A view bound to one key
    pub fn single(&self, key: &str) -> SingleChannel<E> {
        SingleChannel::new(self.clone(), key.to_string(), key.to_string())
    }

    /// A view that maps every key through `map` before touching the hub
    pub fn mapped(&self, map: impl Fn(&str) -> String + Send + Sync + 'static) -> MappedHub<E> {
        MappedHub::new(self.clone(), Arc::new(map))
    }
}
