//! Options travelling with a change request

use chrono::{DateTime, Utc};
use propflow_events::FireMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// When a cached value stops being readable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    /// Relative to the slot's last update
    In(Duration),
    /// Fixed instant
    At(DateTime<Utc>),
}

impl Expiry {
    pub(crate) fn deadline(&self, updated_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Expiry::In(d) => chrono::Duration::from_std(*d)
                .ok()
                .and_then(|d| updated_at.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Expiry::At(at) => *at,
        }
    }
}

/// What an eviction handler is shown on read
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    pub key: String,
    pub value: Value,
    pub format_rev: Option<u64>,
    pub tag: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Returns `true` to evict the current value
pub type EvictHandler = Arc<dyn Fn(&CacheInfo) -> bool + Send + Sync>;

/// Cache policy attached to a write
#[derive(Clone, Default)]
pub struct CacheOptions {
    pub format_rev: Option<u64>,
    pub tag: Option<String>,
    pub expires: Option<Expiry>,
    pub handler: Option<EvictHandler>,
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("format_rev", &self.format_rev)
            .field("tag", &self.tag)
            .field("expires", &self.expires)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format_rev(mut self, rev: u64) -> Self {
        self.format_rev = Some(rev);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn expires_in(mut self, duration: Duration) -> Self {
        self.expires = Some(Expiry::In(duration));
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(Expiry::At(at));
        self
    }

    pub fn handler(mut self, handler: impl Fn(&CacheInfo) -> bool + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

/// Message attached to `set`, `remove` and friends
///
/// A plain string converts into a message with only `message` set.
#[derive(Debug, Clone, Default)]
pub struct ChangeMessage {
    pub message: Option<String>,
    pub source: Option<String>,
    pub addition: Option<Value>,
    pub cache: Option<CacheOptions>,
    /// Only write if the slot holds no value yet
    pub init: bool,
}

impl ChangeMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A message for an initializing write
    pub fn init() -> Self {
        Self {
            init: true,
            ..Self::default()
        }
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

    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = Some(cache);
        self
    }

    pub(crate) fn fire_meta(&self) -> FireMeta {
        FireMeta {
            message: self.message.clone(),
            source: self.source.clone(),
            addition: self.addition.clone(),
        }
    }

    /// Same message with the init flag cleared
    pub(crate) fn plain(&self) -> Self {
        Self {
            init: false,
            ..self.clone()
        }
    }
}

impl From<&str> for ChangeMessage {
    fn from(message: &str) -> Self {
        ChangeMessage::new().with_message(message)
    }
}

impl From<String> for ChangeMessage {
    fn from(message: String) -> Self {
        ChangeMessage::new().with_message(message)
    }
}

impl From<Option<&str>> for ChangeMessage {
    fn from(message: Option<&str>) -> Self {
        message.map(ChangeMessage::from).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_shorthand() {
        let msg: ChangeMessage = "from ui".into();
        assert_eq!(msg.message.as_deref(), Some("from ui"));
        assert!(!msg.init);
        assert!(msg.cache.is_none());
    }

    #[test]
    fn test_relative_expiry_deadline() {
        let updated = DateTime::<Utc>::UNIX_EPOCH;
        let expiry = Expiry::In(Duration::from_secs(5));
        assert_eq!(
            expiry.deadline(updated),
            updated + chrono::Duration::seconds(5)
        );
        let fixed = Expiry::At(updated + chrono::Duration::seconds(1));
        assert_eq!(
            fixed.deadline(updated + chrono::Duration::hours(1)),
            updated + chrono::Duration::seconds(1)
        );
    }

    #[test]
    fn test_fire_meta_copies_fields() {
        let msg = ChangeMessage::from("m")
            .with_source("s")
            .with_addition(serde_json::json!({"n": 1}));
        let meta = msg.fire_meta();
        assert_eq!(meta.message.as_deref(), Some("m"));
        assert_eq!(meta.source.as_deref(), Some("s"));
        assert_eq!(meta.addition, Some(serde_json::json!({"n": 1})));
    }
}
