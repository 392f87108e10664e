//! Handles bound to a single key

use crate::error::ChangeError;
use crate::message::ChangeMessage;
use crate::record::ChangeRecord;
use crate::store::StoreInner;
use crate::PropStore;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// Handle to one slot of a store
///
/// Holds the store weakly. Once the store is dropped, reads return `None`
/// and writes fail with `not-implemented`, as they do through a read-only
/// handle.
#[derive(Clone)]
pub struct PropRef {
    store: Weak<StoreInner>,
    key: String,
    read_only: bool,
}

impl fmt::Debug for PropRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropRef")
            .field("key", &self.key)
            .field("read_only", &self.read_only)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl PropStore {
    pub fn prop(&self, key: &str) -> PropRef {
        PropRef {
            store: Arc::downgrade(&self.inner),
            key: key.to_string(),
            read_only: false,
        }
    }
}

impl PropRef {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A copy of this handle that refuses writes
    pub fn read_only(&self) -> PropRef {
        PropRef {
            read_only: true,
            ..self.clone()
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_detached(&self) -> bool {
        self.store.strong_count() == 0
    }

    pub fn store(&self) -> Option<PropStore> {
        self.store.upgrade().map(|inner| PropStore { inner })
    }

    pub fn get(&self) -> Option<Value> {
        self.store()?.get(&self.key)
    }

    pub fn set(&self, value: Value, message: impl Into<ChangeMessage>) -> ChangeRecord {
        match self.writable() {
            Some(store) => store.set(&self.key, value, message),
            None => self.refused(Some(value)),
        }
    }

    /// Remove the value. A slot without a value yields an unchanged record.
    pub fn remove(&self, message: impl Into<ChangeMessage>) -> ChangeRecord {
        let Some(store) = self.writable() else {
            return self.refused(None);
        };
        store
            .remove([self.key.as_str()], message)
            .pop()
            .unwrap_or_else(|| ChangeRecord::success(&self.key, None, None, None))
    }

    fn writable(&self) -> Option<PropStore> {
        if self.read_only {
            return None;
        }
        self.store()
    }

    fn refused(&self, requested: Option<Value>) -> ChangeRecord {
        ChangeRecord::failure(&self.key, self.get(), requested, ChangeError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ChangeAction;
    use propflow_timing::ManualScheduler;
    use serde_json::json;

    #[test]
    fn test_prop_ref_reads_and_writes() {
        let store = PropStore::new(ManualScheduler::new().shared());
        let name = store.prop("name");
        assert!(name.set(json!("ada"), ChangeMessage::default()).success);
        assert_eq!(store.get("name"), Some(json!("ada")));
        assert_eq!(name.remove(ChangeMessage::default()).action, ChangeAction::Remove);
        assert_eq!(name.remove(ChangeMessage::default()).action, ChangeAction::None);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let store = PropStore::new(ManualScheduler::new().shared());
        store.set("n", json!(1), ChangeMessage::default());
        let view = store.prop("n").read_only();
        assert_eq!(view.get(), Some(json!(1)));
        let record = view.set(json!(2), ChangeMessage::default());
        assert_eq!(record.error, Some(ChangeError::NotImplemented));
        assert_eq!(record.value, Some(json!(1)));
        assert_eq!(store.get("n"), Some(json!(1)));
    }

    #[test]
    fn test_detached_after_store_dropped() {
        let handle = {
            let store = PropStore::new(ManualScheduler::new().shared());
            store.set("n", json!(1), ChangeMessage::default());
            store.prop("n")
        };
        assert!(handle.is_detached());
        assert_eq!(handle.get(), None);
        assert_eq!(
            handle.set(json!(2), ChangeMessage::default()).error,
            Some(ChangeError::NotImplemented)
        );
    }
}
