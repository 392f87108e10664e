//! Reads with cache enforcement
//!
//! A read compares the slot's cache policy against the scheduler clock. An
//! expired value, or one the eviction handler rejects, is cleared silently:
//! no change events fire and the slot's update time is left alone. Reads
//! never create slots.

use crate::error::{StoreError, StoreResult};
use crate::slot::{CacheMeta, SlotDetails};
use crate::PropStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Whether a read applies the cache policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryCheck {
    #[default]
    Enforce,
    Ignore,
}

/// Callback shown the slot's diagnostics during a read
pub type InspectFn = Arc<dyn Fn(&SlotDetails) + Send + Sync>;

/// Filters for [`PropStore::get_with`]
///
/// Filters hide a value from one read without evicting it. A value written
/// without a format revision counts as revision 0.
#[derive(Clone, Default)]
pub struct ReadOptions {
    pub expiry: ExpiryCheck,
    pub min_format_rev: Option<u64>,
    pub max_format_rev: Option<u64>,
    /// Hide values last updated before this instant
    pub not_before: Option<DateTime<Utc>>,
    pub inspect: Option<InspectFn>,
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("expiry", &self.expiry)
            .field("min_format_rev", &self.min_format_rev)
            .field("max_format_rev", &self.max_format_rev)
            .field("not_before", &self.not_before)
            .field("inspect", &self.inspect.is_some())
            .finish()
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore_expiry(mut self) -> Self {
        self.expiry = ExpiryCheck::Ignore;
        self
    }

    pub fn min_format_rev(mut self, rev: u64) -> Self {
        self.min_format_rev = Some(rev);
        self
    }

    pub fn max_format_rev(mut self, rev: u64) -> Self {
        self.max_format_rev = Some(rev);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn inspect(mut self, f: impl Fn(&SlotDetails) + Send + Sync + 'static) -> Self {
        self.inspect = Some(Arc::new(f));
        self
    }

    fn admits(&self, cache: Option<&CacheMeta>, updated_at: Option<DateTime<Utc>>) -> bool {
        let rev = cache.and_then(|c| c.format_rev).unwrap_or(0);
        if self.min_format_rev.is_some_and(|min| rev < min) {
            return false;
        }
        if self.max_format_rev.is_some_and(|max| rev > max) {
            return false;
        }
        match self.not_before {
            Some(at) => updated_at.is_some_and(|t| t >= at),
            None => true,
        }
    }
}

impl PropStore {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_with(key, &ReadOptions::default())
    }

    pub fn get_with(&self, key: &str, options: &ReadOptions) -> Option<Value> {
        let snapshot = {
            let slots = self.inner.slots.lock();
            slots
                .get(key)
                .map(|slot| (slot.value.clone(), slot.cache.clone(), slot.updated_at))
        };
        let (mut value, cache, updated_at) = snapshot?;

        if options.expiry == ExpiryCheck::Enforce {
            if let (Some(current), Some(meta)) = (value.as_ref(), cache.as_ref()) {
                if self.should_evict(key, current, meta, updated_at) {
                    self.evict(key, updated_at);
                    value = None;
                }
            }
        }

        if let Some(inspect) = &options.inspect {
            if let Some(details) = self.get_details(key) {
                inspect(&details);
            }
        }

        value.filter(|_| options.admits(cache.as_ref(), updated_at))
    }

    /// Read and deserialize
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> StoreResult<T> {
        let value = self
            .get(key)
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        serde_json::from_value(value).map_err(|source| StoreError::Deserialize {
            key: key.to_string(),
            source,
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Diagnostics for the slot, without cache enforcement
    pub fn get_details(&self, key: &str) -> Option<SlotDetails> {
        self.inner
            .slots
            .lock()
            .get(key)
            .map(|slot| slot.details(key))
    }

    /// Keys currently holding a value, sorted
    pub fn get_prop_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn should_evict(
        &self,
        key: &str,
        value: &Value,
        meta: &CacheMeta,
        updated_at: Option<DateTime<Utc>>,
    ) -> bool {
        let now = self.inner.scheduler.now();
        if meta.is_expired(now) {
            return true;
        }
        meta.handler
            .as_ref()
            .is_some_and(|handler| handler(&meta.info(key, value, updated_at, now)))
    }

    /// Clear the value unless it was rewritten since `seen` was read
    fn evict(&self, key: &str, seen: Option<DateTime<Utc>>) {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            if slot.updated_at == seen && slot.value.take().is_some() {
                tracing::debug!(store = %self.inner.config.name, key, "evicted cached value");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CacheOptions, ChangeMessage};
    use propflow_timing::ManualScheduler;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn store() -> (ManualScheduler, PropStore) {
        let scheduler = ManualScheduler::new();
        let store = PropStore::new(scheduler.shared());
        (scheduler, store)
    }

    #[test]
    fn test_relative_expiry_evicts_silently() {
        let (scheduler, store) = store();
        let changes = Arc::new(Mutex::new(0));
        let counter = changes.clone();
        store.on_any_changed(move |_, _| *counter.lock().unwrap() += 1);

        let message = ChangeMessage::new().with_cache(CacheOptions::new().expires_in(Duration::from_secs(5)));
        store.set("token", json!("abc"), message);
        scheduler.advance(Duration::from_secs(4));
        assert_eq!(store.get("token"), Some(json!("abc")));

        scheduler.advance(Duration::from_secs(1));
        assert_eq!(store.get("token"), None);
        assert_eq!(*changes.lock().unwrap(), 1);
        assert!(!store.has("token"));
    }

    #[test]
    fn test_ignore_expiry_keeps_value() {
        let (scheduler, store) = store();
        let message = ChangeMessage::new().with_cache(CacheOptions::new().expires_in(Duration::from_secs(1)));
        store.set("k", json!(1), message);
        scheduler.advance(Duration::from_secs(2));
        let options = ReadOptions::new().ignore_expiry();
        assert_eq!(store.get_with("k", &options), Some(json!(1)));
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_rewrite_refreshes_relative_deadline() {
        let (scheduler, store) = store();
        let message = ChangeMessage::new().with_cache(CacheOptions::new().expires_in(Duration::from_secs(10)));
        store.set("k", json!(1), message);
        scheduler.advance(Duration::from_secs(8));
        store.set("k", json!(2), ChangeMessage::default());
        scheduler.advance(Duration::from_secs(8));
        assert_eq!(store.get("k"), Some(json!(2)));
    }

    #[test]
    fn test_evict_handler_sees_cache_info() {
        let (_, store) = store();
        let message = ChangeMessage::new().with_cache(
            CacheOptions::new()
                .format_rev(2)
                .tag("v2")
                .handler(|info| info.tag.as_deref() != Some("v2") || info.value == json!("stale")),
        );
        store.set("k", json!("fresh"), message.clone());
        assert_eq!(store.get("k"), Some(json!("fresh")));
        store.set("k", json!("stale"), message);
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_format_rev_filters_do_not_evict() {
        let (_, store) = store();
        store.set("plain", json!(1), ChangeMessage::default());
        let rev = ChangeMessage::new().with_cache(CacheOptions::new().format_rev(3));
        store.set("rev", json!(2), rev);

        let min = ReadOptions::new().min_format_rev(1);
        assert_eq!(store.get_with("plain", &min), None);
        assert_eq!(store.get_with("rev", &min), Some(json!(2)));
        let max = ReadOptions::new().max_format_rev(2);
        assert_eq!(store.get_with("rev", &max), None);
        assert_eq!(store.get("rev"), Some(json!(2)));
    }

    #[test]
    fn test_not_before_filter() {
        let (scheduler, store) = store();
        store.set("k", json!(1), ChangeMessage::default());
        scheduler.advance(Duration::from_secs(5));
        let cutoff = store.scheduler().now();
        assert_eq!(store.get_with("k", &ReadOptions::new().not_before(cutoff)), None);
        store.set("k", json!(2), ChangeMessage::default());
        assert_eq!(store.get_with("k", &ReadOptions::new().not_before(cutoff)), Some(json!(2)));
    }

    #[test]
    fn test_inspect_and_reads_do_not_create_slots() {
        let (_, store) = store();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let options = ReadOptions::new().inspect(move |details| {
            assert_eq!(details.key, "k");
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(store.get_with("missing", &options), None);
        assert!(store.get_details("missing").is_none());

        store.set("k", json!(1), ChangeMessage::default());
        store.get_with("k", &options);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_get_as_reports_errors() {
        let (_, store) = store();
        store.set("n", json!("x"), ChangeMessage::default());
        assert!(matches!(store.get_as::<u32>("missing"), Err(StoreError::Missing(_))));
        assert!(matches!(store.get_as::<u32>("n"), Err(StoreError::Deserialize { .. })));
        assert_eq!(store.get_as::<String>("n").unwrap(), "x");
    }

    #[test]
    fn test_prop_keys_sorted_and_valued() {
        let (_, store) = store();
        store.set("b", json!(1), ChangeMessage::default());
        store.set("a", json!(1), ChangeMessage::default());
        store.register_change_flow("c", |_: &crate::FlowInput<'_>| None);
        assert_eq!(store.get_prop_keys(), vec!["a", "b"]);
    }
}
