//! The property store handle and its event surface
//!
//! [`PropStore`] owns the key to slot map. The change protocol itself lives
//! in [`crate::protocol`], reads in [`crate::read`] and batches in
//! [`crate::batch`]; this module holds construction, formatter/validator
//! administration, subscriptions, side channels, flow registration and
//! request dispatch.

use crate::config::StoreConfig;
use crate::flow::{resolve_all, ChangeFlow, FlowInput, FlowOutcome, FlowRegistration};
use crate::message::ChangeMessage;
use crate::record::{ChangeHint, ChangeProposal, ChangeRecord};
use crate::request::{HandlerEntry, Request, RequestHandler, RequestRegistration, RequestScope};
use crate::slot::{FlowEntry, Slot};
use parking_lot::{Mutex, RwLock};
use propflow_events::{EventHub, FireMeta, ListenOptions, ListenerCtx, Subscription};
use propflow_timing::SchedulerRef;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Transforms a requested value before validation
pub type Formatter = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Accepts or rejects a formatted value
pub type Validator = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Key every aggregate batch event is fired on
pub const BATCH_KEY: &str = "props";

/// Key global notify/broadcast payloads are fired on
pub const GLOBAL_KEY: &str = "global";

/// The hubs a store announces through
///
/// Exposed for callers that need listener options beyond the defaults used
/// by the `on_*` helpers on [`PropStore`].
pub struct StoreEvents {
    pub changing: EventHub<ChangeProposal>,
    pub changed: EventHub<ChangeRecord>,
    pub failed: EventHub<ChangeRecord>,
    pub batch: EventHub<Vec<ChangeRecord>>,
    pub notify: EventHub<Value>,
    pub prop_notify: EventHub<Value>,
    pub broadcast: EventHub<Value>,
    pub prop_broadcast: EventHub<Value>,
}

impl StoreEvents {
    fn new(scheduler: &SchedulerRef) -> Self {
        Self {
            changing: EventHub::new(scheduler.clone()),
            changed: EventHub::new(scheduler.clone()),
            failed: EventHub::new(scheduler.clone()),
            batch: EventHub::new(scheduler.clone()),
            notify: EventHub::new(scheduler.clone()),
            prop_notify: EventHub::new(scheduler.clone()),
            broadcast: EventHub::new(scheduler.clone()),
            prop_broadcast: EventHub::new(scheduler.clone()),
        }
    }
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) scheduler: SchedulerRef,
    pub(crate) slots: Mutex<HashMap<String, Slot>>,
    pub(crate) formatter: RwLock<Option<Formatter>>,
    pub(crate) validator: RwLock<Option<Validator>>,
    pub(crate) global_handlers: Mutex<HashMap<String, HandlerEntry>>,
    pub(crate) next_id: AtomicU64,
    pub(crate) events: StoreEvents,
}

impl StoreInner {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Keyed reactive state container
///
/// Cloning creates a new handle to the same slots.
#[derive(Clone)]
pub struct PropStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl fmt::Debug for PropStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropStore")
            .field("name", &self.inner.config.name)
            .field("slots", &self.inner.slots.lock().len())
            .finish()
    }
}

impl PropStore {
    pub fn new(scheduler: SchedulerRef) -> Self {
        Self::with_config(StoreConfig::default(), scheduler)
    }

    pub fn with_config(config: StoreConfig, scheduler: SchedulerRef) -> Self {
        let events = StoreEvents::new(&scheduler);
        Self {
            inner: Arc::new(StoreInner {
                config,
                scheduler,
                slots: Mutex::new(HashMap::new()),
                formatter: RwLock::new(None),
                validator: RwLock::new(None),
                global_handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &SchedulerRef {
        &self.inner.scheduler
    }

    pub fn events(&self) -> &StoreEvents {
        &self.inner.events
    }

    // Formatter and validator

    pub fn set_formatter(&self, f: impl Fn(&str, Value) -> Value + Send + Sync + 'static) {
        *self.inner.formatter.write() = Some(Arc::new(f));
    }

    pub fn formatter(&self) -> Option<Formatter> {
        self.inner.formatter.read().clone()
    }

    pub fn clear_formatter(&self) {
        *self.inner.formatter.write() = None;
    }

    pub fn set_validator(&self, f: impl Fn(&str, &Value) -> bool + Send + Sync + 'static) {
        *self.inner.validator.write() = Some(Arc::new(f));
    }

    pub fn validator(&self) -> Option<Validator> {
        self.inner.validator.read().clone()
    }

    pub fn clear_validator(&self) {
        *self.inner.validator.write() = None;
    }

    // Subscriptions

    pub fn on_changing(
        &self,
        key: &str,
        handler: impl Fn(&ChangeProposal, &ListenerCtx<'_, ChangeProposal>) + Send + Sync + 'static,
    ) -> Subscription<ChangeProposal> {
        self.inner
            .events
            .changing
            .on(key, handler, ListenOptions::default())
    }

    pub fn on_any_changing(
        &self,
        handler: impl Fn(&ChangeProposal, &ListenerCtx<'_, ChangeProposal>) + Send + Sync + 'static,
    ) -> Subscription<ChangeProposal> {
        self.inner
            .events
            .changing
            .on_any(handler, ListenOptions::default())
    }

    pub fn on_changed(
        &self,
        key: &str,
        handler: impl Fn(&ChangeRecord, &ListenerCtx<'_, ChangeRecord>) + Send + Sync + 'static,
    ) -> Subscription<ChangeRecord> {
        self.inner
            .events
            .changed
            .on(key, handler, ListenOptions::default())
    }

    pub fn on_any_changed(
        &self,
        handler: impl Fn(&ChangeRecord, &ListenerCtx<'_, ChangeRecord>) + Send + Sync + 'static,
    ) -> Subscription<ChangeRecord> {
        self.inner
            .events
            .changed
            .on_any(handler, ListenOptions::default())
    }

    pub fn on_change_failed(
        &self,
        key: &str,
        handler: impl Fn(&ChangeRecord, &ListenerCtx<'_, ChangeRecord>) + Send + Sync + 'static,
    ) -> Subscription<ChangeRecord> {
        self.inner
            .events
            .failed
            .on(key, handler, ListenOptions::default())
    }

    pub fn on_any_change_failed(
        &self,
        handler: impl Fn(&ChangeRecord, &ListenerCtx<'_, ChangeRecord>) + Send + Sync + 'static,
    ) -> Subscription<ChangeRecord> {
        self.inner
            .events
            .failed
            .on_any(handler, ListenOptions::default())
    }

    /// Aggregate event fired once per `remove` or `batch` call
    pub fn on_props_changed(
        &self,
        handler: impl Fn(&Vec<ChangeRecord>, &ListenerCtx<'_, Vec<ChangeRecord>>)
            + Send
            + Sync
            + 'static,
    ) -> Subscription<Vec<ChangeRecord>> {
        self.inner
            .events
            .batch
            .on(BATCH_KEY, handler, ListenOptions::default())
    }

    pub fn on_notify_received(
        &self,
        handler: impl Fn(&Value, &ListenerCtx<'_, Value>) + Send + Sync + 'static,
    ) -> Subscription<Value> {
        self.inner
            .events
            .notify
            .on(GLOBAL_KEY, handler, ListenOptions::default())
    }

    pub fn on_prop_notify_received(
        &self,
        key: &str,
        handler: impl Fn(&Value, &ListenerCtx<'_, Value>) + Send + Sync + 'static,
    ) -> Subscription<Value> {
        self.inner
            .events
            .prop_notify
            .on(key, handler, ListenOptions::default())
    }

    pub fn on_broadcast_received(
        &self,
        handler: impl Fn(&Value, &ListenerCtx<'_, Value>) + Send + Sync + 'static,
    ) -> Subscription<Value> {
        self.inner
            .events
            .broadcast
            .on(GLOBAL_KEY, handler, ListenOptions::default())
    }

    pub fn on_prop_broadcast_received(
        &self,
        key: &str,
        handler: impl Fn(&Value, &ListenerCtx<'_, Value>) + Send + Sync + 'static,
    ) -> Subscription<Value> {
        self.inner
            .events
            .prop_broadcast
            .on(key, handler, ListenOptions::default())
    }

    // Side channels

    /// Deliver a payload to global notify listeners
    pub fn send_notify(&self, payload: Value, meta: impl Into<FireMeta>) -> usize {
        self.inner.events.notify.fire(GLOBAL_KEY, payload, meta)
    }

    /// Deliver a payload to notify listeners of one key
    pub fn send_prop_notify(&self, key: &str, payload: Value, meta: impl Into<FireMeta>) -> usize {
        self.inner.events.prop_notify.fire(key, payload, meta)
    }

    /// Deliver a payload to global broadcast listeners and to the broadcast
    /// listeners of every key
    pub fn send_broadcast(&self, payload: Value, meta: impl Into<FireMeta>) -> usize {
        let meta = meta.into();
        let events = &self.inner.events;
        let mut delivered = events
            .broadcast
            .fire(GLOBAL_KEY, payload.clone(), meta.clone());
        for key in events.prop_broadcast.keys() {
            delivered += events
                .prop_broadcast
                .fire(&key, payload.clone(), meta.clone());
        }
        delivered
    }

    /// Deliver a payload to the broadcast listeners of one key
    pub fn send_prop_broadcast(
        &self,
        key: &str,
        payload: Value,
        meta: impl Into<FireMeta>,
    ) -> usize {
        self.inner.events.prop_broadcast.fire(key, payload, meta)
    }

    // Change flows

    /// Append flows to the slot's interceptor chain
    pub fn register_change_flows(
        &self,
        key: &str,
        flows: Vec<Arc<dyn ChangeFlow>>,
    ) -> FlowRegistration {
        let id = self.inner.next_id();
        let registration = FlowRegistration {
            store: Arc::downgrade(&self.inner),
            key: key.to_string(),
            id,
            disposed: Arc::new(AtomicBool::new(false)),
        };
        if key.is_empty() {
            registration.disposed.store(true, Ordering::SeqCst);
            return registration;
        }

        let mut slots = self.inner.slots.lock();
        let slot = slots.entry(key.to_string()).or_default();
        slot.flows.extend(flows.into_iter().map(|flow| FlowEntry {
            registration: id,
            flow,
        }));
        registration
    }

    /// Register a single flow
    pub fn register_change_flow(
        &self,
        key: &str,
        flow: impl Fn(&FlowInput<'_>) -> Option<FlowOutcome> + Send + Sync + 'static,
    ) -> FlowRegistration {
        let flow: Arc<dyn ChangeFlow> = Arc::new(flow);
        self.register_change_flows(key, vec![flow])
    }

    /// Remove every flow on the slot. Returns how many were removed.
    pub fn clear_change_flow(&self, key: &str) -> usize {
        self.inner
            .slots
            .lock()
            .get_mut(key)
            .map_or(0, |slot| std::mem::take(&mut slot.flows).len())
    }

    pub(crate) fn detach_flows(&self, key: &str, registration: u64) {
        if let Some(slot) = self.inner.slots.lock().get_mut(key) {
            slot.flows.retain(|entry| entry.registration != registration);
        }
    }

    pub(crate) fn sync_flows(&self, key: &str, registration: u64, message: &ChangeMessage) -> usize {
        let (flows, current) = {
            let slots = self.inner.slots.lock();
            let Some(slot) = slots.get(key) else {
                return 0;
            };
            let flows: Vec<_> = slot
                .flows
                .iter()
                .filter(|entry| entry.registration == registration)
                .cloned()
                .collect();
            (flows, slot.value.clone())
        };

        let input = FlowInput {
            key,
            old_value: current.as_ref(),
            value_request: current.as_ref(),
            message,
            hint: ChangeHint::Unknown,
            sync: true,
        };
        let outcomes: Vec<_> = flows
            .iter()
            .filter_map(|entry| entry.flow.intercept(&input))
            .collect();
        let record = ChangeRecord::success(key, current.clone(), current.clone(), current);
        resolve_all(outcomes, &record);
        tracing::trace!(store = %self.inner.config.name, key, flows = flows.len(), "synced change flows");
        flows.len()
    }

    // Request handlers

    /// Register `handler` for requests of `kind`, replacing any previous
    /// handler of that kind in the same scope
    pub fn register_request_handler(
        &self,
        scope: impl Into<RequestScope>,
        kind: &str,
        handler: impl Fn(&PropStore, &Request) + Send + Sync + 'static,
    ) -> RequestRegistration {
        let scope = scope.into();
        let id = self.inner.next_id();
        let entry = HandlerEntry {
            id,
            handler: Arc::new(handler) as RequestHandler,
        };
        match &scope {
            RequestScope::Global => {
                self.inner
                    .global_handlers
                    .lock()
                    .insert(kind.to_string(), entry);
            }
            RequestScope::Prop(key) => {
                self.inner
                    .slots
                    .lock()
                    .entry(key.clone())
                    .or_default()
                    .handlers
                    .insert(kind.to_string(), entry);
            }
        }
        RequestRegistration {
            store: Arc::downgrade(&self.inner),
            scope,
            kind: kind.to_string(),
            id,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn unregister_request_handler(&self, scope: &RequestScope, kind: &str, id: u64) {
        match scope {
            RequestScope::Global => {
                let mut handlers = self.inner.global_handlers.lock();
                if handlers.get(kind).is_some_and(|e| e.id == id) {
                    handlers.remove(kind);
                }
            }
            RequestScope::Prop(key) => {
                if let Some(slot) = self.inner.slots.lock().get_mut(key) {
                    if slot.handlers.get(kind).is_some_and(|e| e.id == id) {
                        slot.handlers.remove(kind);
                    }
                }
            }
        }
    }

    /// Dispatch to the global table. Returns whether a handler ran.
    pub fn send_request(&self, kind: &str, payload: Value) -> bool {
        let handler = self
            .inner
            .global_handlers
            .lock()
            .get(kind)
            .map(|e| e.handler.clone());
        let Some(handler) = handler else {
            tracing::trace!(store = %self.inner.config.name, kind, "no handler for request");
            return false;
        };
        handler(
            self,
            &Request {
                kind: kind.to_string(),
                key: None,
                payload,
            },
        );
        true
    }

    /// Dispatch to the slot's table, falling back to the global one
    pub fn send_prop_request(&self, key: &str, kind: &str, payload: Value) -> bool {
        let local = self
            .inner
            .slots
            .lock()
            .get(key)
            .and_then(|slot| slot.handlers.get(kind))
            .map(|e| e.handler.clone());
        let handler = local.or_else(|| {
            self.inner
                .global_handlers
                .lock()
                .get(kind)
                .map(|e| e.handler.clone())
        });
        let Some(handler) = handler else {
            tracing::trace!(store = %self.inner.config.name, key, kind, "no handler for request");
            return false;
        };
        handler(
            self,
            &Request {
                kind: kind.to_string(),
                key: Some(key.to_string()),
                payload,
            },
        );
        true
    }
}
