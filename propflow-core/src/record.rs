//! Records describing change attempts

use crate::error::ChangeError;
use propflow_timing::Settlement;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one change attempt, resolved with the success record or
/// rejected with the failure record
pub type ChangeResolution = Settlement<ChangeRecord, ChangeRecord>;

/// Classification of a finished attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Remove,
    Update,
    None,
    Invalid,
}

impl ChangeAction {
    pub(crate) fn classify(old: Option<&Value>, new: Option<&Value>) -> Self {
        match (old, new) {
            (None, None) => ChangeAction::None,
            (None, Some(_)) => ChangeAction::Add,
            (Some(_), None) => ChangeAction::Remove,
            (Some(a), Some(b)) if a == b => ChangeAction::None,
            (Some(_), Some(_)) => ChangeAction::Update,
        }
    }
}

/// What a proposal is expected to do, announced before it commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeHint {
    Add,
    Update,
    Delete,
    Unknown,
}

impl ChangeHint {
    pub(crate) fn for_request(old: Option<&Value>, requested: Option<&Value>) -> Self {
        match (old, requested) {
            (None, Some(_)) => ChangeHint::Add,
            (Some(_), Some(_)) => ChangeHint::Update,
            (_, None) => ChangeHint::Delete,
        }
    }
}

/// Result of a change attempt, handed to `changed`/`failed` subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub key: String,
    pub action: ChangeAction,
    pub success: bool,
    /// Value after the attempt
    pub value: Option<Value>,
    /// Value before the attempt
    pub old_value: Option<Value>,
    /// Value originally requested
    pub value_request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ChangeError>,
}

impl ChangeRecord {
    pub(crate) fn success(
        key: &str,
        old_value: Option<Value>,
        value: Option<Value>,
        value_request: Option<Value>,
    ) -> Self {
        Self {
            key: key.to_string(),
            action: ChangeAction::classify(old_value.as_ref(), value.as_ref()),
            success: true,
            value,
            old_value,
            value_request,
            error: None,
        }
    }

    /// A failed attempt leaves the slot untouched, so `value` and
    /// `old_value` are both the current value.
    pub(crate) fn failure(
        key: &str,
        current: Option<Value>,
        value_request: Option<Value>,
        error: ChangeError,
    ) -> Self {
        Self {
            key: key.to_string(),
            action: ChangeAction::Invalid,
            success: false,
            value: current.clone(),
            old_value: current,
            value_request,
            error: Some(error),
        }
    }

    /// Committed and altered the stored value
    pub fn is_changed(&self) -> bool {
        self.success && self.action != ChangeAction::None
    }

    /// Net effect of this attempt followed by a later one on the same key.
    ///
    /// Keeps this record's old value and the later record's value. The
    /// request comes from the last attempt that committed. Two failures
    /// collapse to the later one.
    pub(crate) fn then(self, later: ChangeRecord) -> ChangeRecord {
        if !self.success && !later.success {
            return later;
        }
        let value_request = if later.success {
            later.value_request
        } else {
            self.value_request
        };
        ChangeRecord::success(&later.key, self.old_value, later.value, value_request)
    }
}

/// A change about to be attempted, handed to `changing` subscribers
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    pub key: String,
    pub old_value: Option<Value>,
    pub value_request: Option<Value>,
    pub hint: ChangeHint,
    /// Settles once the attempt commits, fails or is superseded
    pub resolution: ChangeResolution,
}
