//! Per-key slot records and update tokens

use crate::flow::{ChangeFlow, FlowOutcome};
use crate::message::{CacheInfo, CacheOptions, ChangeMessage, EvictHandler, Expiry};
use crate::record::ChangeResolution;
use crate::request::HandlerEntry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct FlowEntry {
    pub registration: u64,
    pub flow: Arc<dyn ChangeFlow>,
}

/// The in-flight proposal on a slot
pub(crate) struct UpdateToken {
    pub id: u64,
    pub requested: Option<Value>,
    /// Resolution is deferred to a [`CustomChange`](crate::CustomChange)
    pub custom: bool,
    pub resolution: ChangeResolution,
    pub outcomes: Vec<FlowOutcome>,
    pub message: ChangeMessage,
}

/// Cache policy of a slot with the deadline derived from it
#[derive(Clone)]
pub(crate) struct CacheMeta {
    pub format_rev: Option<u64>,
    pub tag: Option<String>,
    pub expires: Option<Expiry>,
    pub handler: Option<EvictHandler>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheMeta {
    pub fn from_options(options: &CacheOptions, updated_at: DateTime<Utc>) -> Self {
        let mut meta = Self {
            format_rev: options.format_rev,
            tag: options.tag.clone(),
            expires: options.expires,
            handler: options.handler.clone(),
            expires_at: None,
        };
        meta.refresh(updated_at);
        meta
    }

    pub fn expiring_in(duration: Duration, updated_at: DateTime<Utc>) -> Self {
        Self::from_options(&CacheOptions::new().expires_in(duration), updated_at)
    }

    /// Recompute the deadline after a commit
    pub fn refresh(&mut self, updated_at: DateTime<Utc>) {
        self.expires_at = self.expires.map(|e| e.deadline(updated_at));
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn details(&self) -> CacheDetails {
        CacheDetails {
            format_rev: self.format_rev,
            tag: self.tag.clone(),
            expires_at: self.expires_at,
            has_handler: self.handler.is_some(),
        }
    }

    pub fn info(
        &self,
        key: &str,
        value: &Value,
        updated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CacheInfo {
        CacheInfo {
            key: key.to_string(),
            value: value.clone(),
            format_rev: self.format_rev,
            tag: self.tag.clone(),
            updated_at,
            expires_at: self.expires_at,
            now,
        }
    }
}

#[derive(Default)]
pub(crate) struct Slot {
    pub value: Option<Value>,
    pub flows: Vec<FlowEntry>,
    pub handlers: HashMap<String, HandlerEntry>,
    pub cache: Option<CacheMeta>,
    pub updated_at: Option<DateTime<Utc>>,
    pub token: Option<UpdateToken>,
}

impl Slot {
    pub fn holds_token(&self, id: u64) -> bool {
        self.token.as_ref().is_some_and(|t| t.id == id)
    }

    pub fn details(&self, key: &str) -> SlotDetails {
        let mut request_types: Vec<String> = self.handlers.keys().cloned().collect();
        request_types.sort();
        SlotDetails {
            key: key.to_string(),
            has_value: self.value.is_some(),
            value: self.value.clone(),
            cache: self.cache.as_ref().map(CacheMeta::details),
            updated_at: self.updated_at,
            request_types,
            flow_count: self.flows.len(),
            pending: self.token.is_some(),
        }
    }
}

/// Cache policy as reported by [`SlotDetails`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheDetails {
    pub format_rev: Option<u64>,
    pub tag: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub has_handler: bool,
}

/// Diagnostics for one slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotDetails {
    pub key: String,
    pub has_value: bool,
    pub value: Option<Value>,
    pub cache: Option<CacheDetails>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Registered request handler types, sorted
    pub request_types: Vec<String>,
    /// Number of registered change flows
    pub flow_count: usize,
    /// A proposal is in flight
    pub pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_expiry_refreshes() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let mut meta = CacheMeta::expiring_in(Duration::from_secs(10), t0);
        assert!(!meta.is_expired(t0 + chrono::Duration::seconds(9)));
        assert!(meta.is_expired(t0 + chrono::Duration::seconds(10)));

        meta.refresh(t0 + chrono::Duration::seconds(10));
        assert!(!meta.is_expired(t0 + chrono::Duration::seconds(15)));
    }

    #[test]
    fn test_details_sorts_request_types() {
        let mut slot = Slot::default();
        let handler: crate::RequestHandler = Arc::new(|_, _| {});
        for kind in ["increase", "decrease"] {
            slot.handlers.insert(
                kind.to_string(),
                HandlerEntry {
                    id: 1,
                    handler: handler.clone(),
                },
            );
        }
        let details = slot.details("n");
        assert_eq!(details.request_types, vec!["decrease", "increase"]);
        assert!(!details.has_value);
        assert!(!details.pending);
    }
}
