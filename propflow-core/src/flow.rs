//! Change flows: interceptors that observe or veto proposed changes
//!
//! A flow never alters the requested value. It may return a
//! [`FlowOutcome`] to hear about the eventual result of the attempt, or to
//! veto it. A veto fails the attempt exactly like a validator rejection.

use crate::message::ChangeMessage;
use crate::record::{ChangeHint, ChangeRecord};
use crate::store::StoreInner;
use crate::PropStore;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// What a flow sees of a proposed change
#[derive(Debug, Clone, Copy)]
pub struct FlowInput<'a> {
    pub key: &'a str,
    pub old_value: Option<&'a Value>,
    /// `None` for removals
    pub value_request: Option<&'a Value>,
    pub message: &'a ChangeMessage,
    pub hint: ChangeHint,
    /// Set when re-run through [`FlowRegistration::sync`] rather than a
    /// real change
    pub sync: bool,
}

/// Interceptor registered on a slot
pub trait ChangeFlow: Send + Sync {
    fn intercept(&self, input: &FlowInput<'_>) -> Option<FlowOutcome>;
}

impl<F> ChangeFlow for F
where
    F: Fn(&FlowInput<'_>) -> Option<FlowOutcome> + Send + Sync,
{
    fn intercept(&self, input: &FlowInput<'_>) -> Option<FlowOutcome> {
        self(input)
    }
}

type OutcomeCallback = Box<dyn FnOnce(&ChangeRecord) + Send + 'static>;

/// A flow's handle on the eventual outcome of one attempt
///
/// Dropped uncalled when the attempt commits without changing the value.
#[derive(Default)]
pub struct FlowOutcome {
    on_resolve: Option<OutcomeCallback>,
    on_reject: Option<OutcomeCallback>,
    veto: bool,
}

impl fmt::Debug for FlowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowOutcome")
            .field("on_resolve", &self.on_resolve.is_some())
            .field("on_reject", &self.on_reject.is_some())
            .field("veto", &self.veto)
            .finish()
    }
}

impl FlowOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    /// An outcome that fails the attempt as `invalid`
    pub fn veto() -> Self {
        Self {
            veto: true,
            ..Self::default()
        }
    }

    pub fn on_resolve(mut self, f: impl FnOnce(&ChangeRecord) + Send + 'static) -> Self {
        self.on_resolve = Some(Box::new(f));
        self
    }

    pub fn on_reject(mut self, f: impl FnOnce(&ChangeRecord) + Send + 'static) -> Self {
        self.on_reject = Some(Box::new(f));
        self
    }

    pub fn is_veto(&self) -> bool {
        self.veto
    }

    pub(crate) fn resolve(self, record: &ChangeRecord) {
        if let Some(f) = self.on_resolve {
            f(record);
        }
    }

    pub(crate) fn reject(self, record: &ChangeRecord) {
        if let Some(f) = self.on_reject {
            f(record);
        }
    }
}

pub(crate) fn reject_all(outcomes: Vec<FlowOutcome>, record: &ChangeRecord) {
    for outcome in outcomes {
        outcome.reject(record);
    }
}

pub(crate) fn resolve_all(outcomes: Vec<FlowOutcome>, record: &ChangeRecord) {
    for outcome in outcomes {
        outcome.resolve(record);
    }
}

/// Handle to flows registered together on one key
#[derive(Clone)]
pub struct FlowRegistration {
    pub(crate) store: Weak<StoreInner>,
    pub(crate) key: String,
    pub(crate) id: u64,
    pub(crate) disposed: Arc<AtomicBool>,
}

impl fmt::Debug for FlowRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistration")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl FlowRegistration {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Re-run these flows against the current value without committing.
    ///
    /// Every outcome they return is resolved at once with a `none` record.
    /// Returns how many flows ran.
    pub fn sync(&self, message: impl Into<ChangeMessage>) -> usize {
        if self.is_disposed() {
            return 0;
        }
        let Some(inner) = self.store.upgrade() else {
            return 0;
        };
        PropStore { inner }.sync_flows(&self.key, self.id, &message.into())
    }

    /// Detach these flows from the slot. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            PropStore { inner }.detach_flows(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChangeError;
    use std::sync::Mutex;

    #[test]
    fn test_outcome_runs_only_matching_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ok = log.clone();
        let err = log.clone();
        let outcome = FlowOutcome::new()
            .on_resolve(move |r| ok.lock().unwrap().push(format!("ok:{}", r.key)))
            .on_reject(move |r| err.lock().unwrap().push(format!("err:{}", r.key)));
        let record = ChangeRecord::failure("k", None, None, ChangeError::Expired);
        outcome.reject(&record);
        assert_eq!(*log.lock().unwrap(), vec!["err:k"]);
    }

    fn veto_null(input: &FlowInput<'_>) -> Option<FlowOutcome> {
        if input.value_request == Some(&Value::Null) {
            Some(FlowOutcome::veto())
        } else {
            None
        }
    }

    #[test]
    fn test_fn_is_a_flow() {
        let message = ChangeMessage::default();
        let input = FlowInput {
            key: "k",
            old_value: None,
            value_request: Some(&Value::Null),
            message: &message,
            hint: ChangeHint::Add,
            sync: false,
        };
        assert!(veto_null.intercept(&input).is_some_and(|o| o.is_veto()));
    }
}
