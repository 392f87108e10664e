//! The keyed state change protocol
//!
//! One attempt to change a slot moves through these steps:
//!
//! 1. reject an empty key, an `init` write to a slot that already holds a
//!    value, or an exact repeat of a pending synchronous request;
//! 2. install a fresh update token, expiring whatever token it replaces;
//! 3. announce `changing` with the attempt's [`ChangeResolution`];
//! 4. run the slot's change flows and collect their outcomes;
//! 5. format, then validate (removals skip both);
//! 6. commit or fail, but only while the attempt still holds the token.
//!
//! # Invariants
//!
//! 1. A slot holds at most one token. Every superseded token has its
//!    resolution rejected as `expired` exactly once, and its flow outcomes
//!    are rejected with the same record.
//! 2. Only the current token may commit or fail the slot. Any later
//!    settlement attempt by a stale holder reports `expired` and changes
//!    nothing.
//! 3. `changed` fires only when the committed value differs from the old
//!    one. An unchanged commit drops the flow outcomes uncalled.
//! 4. The slot map lock is never held while formatters, validators, flows
//!    or event handlers run, so all of them may re-enter the store.

use crate::error::{ChangeError, StoreError, StoreResult};
use crate::flow::{reject_all, resolve_all, FlowInput, FlowOutcome};
use crate::message::ChangeMessage;
use crate::record::{ChangeHint, ChangeProposal, ChangeRecord, ChangeResolution};
use crate::slot::{CacheMeta, FlowEntry, UpdateToken};
use crate::PropStore;
use parking_lot::Mutex;
use propflow_events::FireMeta;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// An attempt that passed the early checks and holds a token
struct Begun {
    token: u64,
    requested: Option<Value>,
    candidate: Option<Value>,
    resolution: ChangeResolution,
    vetoed: bool,
}

impl PropStore {
    /// Propose `value` for `key` and commit it synchronously if it survives
    /// flows, formatter and validator
    pub fn set(&self, key: &str, value: Value, message: impl Into<ChangeMessage>) -> ChangeRecord {
        self.apply(key, Some(value), message.into())
    }

    /// [`set`](Self::set) for any serializable value
    pub fn set_serialized<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        message: impl Into<ChangeMessage>,
    ) -> StoreResult<ChangeRecord> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Serialize {
            key: key.to_string(),
            source,
        })?;
        Ok(self.set(key, value, message))
    }

    /// Start a two-phase change. The returned handle decides the final value
    /// later; the slot is untouched until then.
    pub fn customized_set(
        &self,
        key: &str,
        value: Value,
        message: impl Into<ChangeMessage>,
    ) -> CustomChange {
        let message = message.into();
        match self.begin(key, Some(value), &message, true) {
            Err(record) => CustomChange::finished(self.clone(), key, record),
            Ok(begun) => {
                let vetoed = begun.vetoed;
                let change = CustomChange {
                    store: self.clone(),
                    key: key.to_string(),
                    token: Some(begun.token),
                    requested: begun.requested,
                    candidate: begun.candidate,
                    resolution: Some(begun.resolution),
                    settling: AtomicBool::new(false),
                    record: Mutex::new(None),
                };
                if vetoed {
                    change.reject(ChangeError::Invalid);
                }
                change
            }
        }
    }

    /// Re-announce the current value through `changing` and `changed`
    /// without touching the slot
    pub fn force_update(&self, key: &str) -> ChangeRecord {
        if key.is_empty() {
            return ChangeRecord::failure(key, None, None, ChangeError::InvalidKey);
        }
        let current = self.current_value(key);
        let record = ChangeRecord::success(key, current.clone(), current.clone(), current.clone());
        let resolution = ChangeResolution::resolved(self.inner.scheduler.clone(), record.clone());
        let events = &self.inner.events;
        events.changing.fire(
            key,
            ChangeProposal {
                key: key.to_string(),
                old_value: current.clone(),
                value_request: current,
                hint: ChangeHint::Unknown,
                resolution,
            },
            FireMeta::default(),
        );
        events.changed.fire(key, record.clone(), FireMeta::default());
        tracing::debug!(store = %self.inner.config.name, key, "forced update");
        record
    }

    /// Value currently stored, without any cache checks
    pub(crate) fn current_value(&self, key: &str) -> Option<Value> {
        self.inner
            .slots
            .lock()
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    /// One-phase attempt; `None` requests removal
    pub(crate) fn apply(
        &self,
        key: &str,
        requested: Option<Value>,
        message: ChangeMessage,
    ) -> ChangeRecord {
        let begun = match self.begin(key, requested, &message, false) {
            Ok(begun) => begun,
            Err(record) => return record,
        };
        if begun.vetoed || !self.validate(key, begun.candidate.as_ref()) {
            return self.fail(key, begun.token, begun.requested, ChangeError::Invalid);
        }
        self.commit(key, begun.token, begun.requested, begun.candidate)
    }

    fn validate(&self, key: &str, candidate: Option<&Value>) -> bool {
        let Some(candidate) = candidate else {
            return true;
        };
        self.validator().map_or(true, |validator| validator(key, candidate))
    }

    fn begin(
        &self,
        key: &str,
        requested: Option<Value>,
        message: &ChangeMessage,
        custom: bool,
    ) -> Result<Begun, ChangeRecord> {
        let name = &self.inner.config.name;
        if key.is_empty() {
            tracing::debug!(store = %name, "rejected change for empty key");
            return Err(ChangeRecord::failure(
                key,
                None,
                requested,
                ChangeError::InvalidKey,
            ));
        }

        let token = self.inner.next_id();
        let resolution = ChangeResolution::with_options(
            self.inner.scheduler.clone(),
            self.inner.config.defer_late_callbacks,
        );
        let (old_value, superseded, flows) = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            if message.init && slot.value.is_some() {
                return Err(ChangeRecord::failure(
                    key,
                    slot.value.clone(),
                    requested,
                    ChangeError::Ignore,
                ));
            }
            if let Some(pending) = &slot.token {
                if !pending.custom && pending.requested == requested {
                    tracing::debug!(store = %name, key, token = pending.id, "duplicated request");
                    return Err(ChangeRecord::failure(
                        key,
                        slot.value.clone(),
                        requested,
                        ChangeError::Duplicated,
                    ));
                }
            }
            let superseded = slot.token.replace(UpdateToken {
                id: token,
                requested: requested.clone(),
                custom,
                resolution: resolution.clone(),
                outcomes: Vec::new(),
                message: message.plain(),
            });
            (slot.value.clone(), superseded, slot.flows.clone())
        };
        if let Some(previous) = superseded {
            self.expire(key, previous, old_value.clone());
        }

        let hint = ChangeHint::for_request(old_value.as_ref(), requested.as_ref());
        self.inner.events.changing.fire(
            key,
            ChangeProposal {
                key: key.to_string(),
                old_value: old_value.clone(),
                value_request: requested.clone(),
                hint,
                resolution: resolution.clone(),
            },
            message.fire_meta(),
        );

        let outcomes = self.run_flows(key, &flows, old_value.as_ref(), requested.as_ref(), message, hint);
        let vetoed = outcomes.iter().any(FlowOutcome::is_veto);
        self.attach_outcomes(key, token, requested.as_ref(), outcomes);

        let candidate = requested.clone().map(|value| match self.formatter() {
            Some(formatter) => formatter(key, value),
            None => value,
        });

        tracing::trace!(store = %name, key, token, custom, ?hint, "change proposed");
        Ok(Begun {
            token,
            requested,
            candidate,
            resolution,
            vetoed,
        })
    }

    fn run_flows(
        &self,
        key: &str,
        flows: &[FlowEntry],
        old_value: Option<&Value>,
        requested: Option<&Value>,
        message: &ChangeMessage,
        hint: ChangeHint,
    ) -> Vec<FlowOutcome> {
        if flows.is_empty() {
            return Vec::new();
        }
        let input = FlowInput {
            key,
            old_value,
            value_request: requested,
            message,
            hint,
            sync: false,
        };
        flows
            .iter()
            .filter_map(|entry| entry.flow.intercept(&input))
            .collect()
    }

    /// Park flow outcomes on the token. If the token was superseded while
    /// the flows ran, the outcomes are rejected right away.
    fn attach_outcomes(
        &self,
        key: &str,
        token: u64,
        requested: Option<&Value>,
        outcomes: Vec<FlowOutcome>,
    ) {
        if outcomes.is_empty() {
            return;
        }
        let stale = {
            let mut slots = self.inner.slots.lock();
            match slots
                .get_mut(key)
                .and_then(|slot| slot.token.as_mut())
                .filter(|pending| pending.id == token)
            {
                Some(pending) => {
                    pending.outcomes.extend(outcomes);
                    None
                }
                None => Some(outcomes),
            }
        };
        if let Some(outcomes) = stale {
            let record = ChangeRecord::failure(
                key,
                self.current_value(key),
                requested.cloned(),
                ChangeError::Expired,
            );
            reject_all(outcomes, &record);
        }
    }

    /// Settle a superseded token
    fn expire(&self, key: &str, token: UpdateToken, current: Option<Value>) {
        tracing::debug!(store = %self.inner.config.name, key, token = token.id, "superseded pending change");
        let record = ChangeRecord::failure(key, current, token.requested, ChangeError::Expired);
        token.resolution.reject(record.clone());
        reject_all(token.outcomes, &record);
    }

    /// Result for an attempt that no longer holds its slot's token
    fn stale(&self, key: &str, token: u64, requested: Option<Value>) -> ChangeRecord {
        tracing::debug!(store = %self.inner.config.name, key, token, "stale change settled as expired");
        ChangeRecord::failure(key, self.current_value(key), requested, ChangeError::Expired)
    }

    pub(crate) fn fail(
        &self,
        key: &str,
        token: u64,
        requested: Option<Value>,
        error: ChangeError,
    ) -> ChangeRecord {
        let taken = {
            let mut slots = self.inner.slots.lock();
            slots.get_mut(key).and_then(|slot| {
                if slot.holds_token(token) {
                    slot.token.take().map(|t| (t, slot.value.clone()))
                } else {
                    None
                }
            })
        };
        let Some((pending, current)) = taken else {
            return self.stale(key, token, requested);
        };

        let record = ChangeRecord::failure(key, current, pending.requested, error);
        pending.resolution.reject(record.clone());
        self.inner
            .events
            .failed
            .fire(key, record.clone(), pending.message.fire_meta());
        reject_all(pending.outcomes, &record);
        tracing::debug!(store = %self.inner.config.name, key, token, error = error.tag(), "change failed");
        record
    }

    pub(crate) fn commit(
        &self,
        key: &str,
        token: u64,
        requested: Option<Value>,
        candidate: Option<Value>,
    ) -> ChangeRecord {
        let now = self.inner.scheduler.now();
        let committed = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(key) {
                Some(slot) if slot.holds_token(token) => slot.token.take().map(|pending| {
                    let old = slot.value.clone();
                    slot.updated_at = Some(now);
                    if candidate.is_none() {
                        slot.cache = None;
                    } else if let Some(options) = &pending.message.cache {
                        slot.cache = Some(CacheMeta::from_options(options, now));
                    } else if let Some(meta) = slot.cache.as_mut() {
                        meta.refresh(now);
                    } else if let Some(expires_in) = self.inner.config.default_expires_in() {
                        slot.cache = Some(CacheMeta::expiring_in(expires_in, now));
                    }
                    slot.value = candidate.clone();
                    let record =
                        ChangeRecord::success(key, old, candidate, pending.requested.clone());
                    (pending, record)
                }),
                _ => None,
            }
        };
        let Some((pending, record)) = committed else {
            return self.stale(key, token, requested);
        };

        pending.resolution.resolve(record.clone());
        if record.is_changed() {
            self.inner
                .events
                .changed
                .fire(key, record.clone(), pending.message.fire_meta());
            resolve_all(pending.outcomes, &record);
        }
        tracing::debug!(
            store = %self.inner.config.name,
            key,
            token,
            action = ?record.action,
            "committed change"
        );
        record
    }

    /// Expire a token whose two-phase handle was dropped unsettled
    fn abandon(&self, key: &str, token: u64) {
        let taken = {
            let mut slots = self.inner.slots.lock();
            slots.get_mut(key).and_then(|slot| {
                if slot.holds_token(token) {
                    slot.token.take().map(|t| (t, slot.value.clone()))
                } else {
                    None
                }
            })
        };
        if let Some((pending, current)) = taken {
            self.expire(key, pending, current);
        }
    }
}

/// Caller-held handle deciding a two-phase change
///
/// Exactly one of [`resolve`](Self::resolve), [`reject`](Self::reject) or
/// [`remove`](Self::remove) takes effect; later calls return the record of
/// the first. If a later request superseded this change, the first call
/// reports `expired` and leaves the slot alone. Dropping the handle
/// unsettled expires the change.
pub struct CustomChange {
    store: PropStore,
    key: String,
    /// `None` when the change failed before a token was installed
    token: Option<u64>,
    requested: Option<Value>,
    candidate: Option<Value>,
    resolution: Option<ChangeResolution>,
    settling: AtomicBool,
    record: Mutex<Option<ChangeRecord>>,
}

impl fmt::Debug for CustomChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomChange")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("requested", &self.requested)
            .field("candidate", &self.candidate)
            .field("record", &*self.record.lock())
            .finish()
    }
}

impl CustomChange {
    fn finished(store: PropStore, key: &str, record: ChangeRecord) -> Self {
        Self {
            store,
            key: key.to_string(),
            token: None,
            requested: record.value_request.clone(),
            candidate: None,
            resolution: None,
            settling: AtomicBool::new(true),
            record: Mutex::new(Some(record)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value originally requested
    pub fn requested(&self) -> Option<&Value> {
        self.requested.as_ref()
    }

    /// Requested value after the store's formatter
    pub fn candidate(&self) -> Option<&Value> {
        self.candidate.as_ref()
    }

    /// Resolution announced to `changing` subscribers, `None` if the change
    /// was refused before it started
    pub fn resolution(&self) -> Option<&ChangeResolution> {
        self.resolution.as_ref()
    }

    pub fn is_settled(&self) -> bool {
        self.settling.load(Ordering::SeqCst)
    }

    /// Record of the settling call, once there is one
    pub fn record(&self) -> Option<ChangeRecord> {
        self.record.lock().clone()
    }

    /// Commit `value`, which may differ from the requested value. The
    /// validator still applies.
    pub fn resolve(&self, value: Value) -> ChangeRecord {
        self.settle(|store, token| {
            if store.validate(&self.key, Some(&value)) {
                store.commit(&self.key, token, self.requested.clone(), Some(value))
            } else {
                store.fail(&self.key, token, self.requested.clone(), ChangeError::Invalid)
            }
        })
    }

    /// Fail the change with `error`
    pub fn reject(&self, error: ChangeError) -> ChangeRecord {
        self.settle(|store, token| store.fail(&self.key, token, self.requested.clone(), error))
    }

    /// Commit absence instead of a value
    pub fn remove(&self) -> ChangeRecord {
        self.settle(|store, token| store.commit(&self.key, token, self.requested.clone(), None))
    }

    fn settle(&self, f: impl FnOnce(&PropStore, u64) -> ChangeRecord) -> ChangeRecord {
        if self.settling.swap(true, Ordering::SeqCst) {
            // Settled already, or settling further up this call stack.
            return self.record.lock().clone().unwrap_or_else(|| {
                ChangeRecord::failure(
                    &self.key,
                    self.store.current_value(&self.key),
                    self.requested.clone(),
                    ChangeError::Duplicated,
                )
            });
        }
        let record = match self.token {
            Some(token) => f(&self.store, token),
            None => ChangeRecord::failure(
                &self.key,
                self.store.current_value(&self.key),
                self.requested.clone(),
                ChangeError::Expired,
            ),
        };
        *self.record.lock() = Some(record.clone());
        record
    }
}

impl Drop for CustomChange {
    fn drop(&mut self) {
        if self.settling.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.token {
            self.store.abandon(&self.key, token);
        }
    }
}
