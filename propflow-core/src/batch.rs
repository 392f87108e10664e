//! Multi-key writes with one aggregate event

use crate::error::{StoreError, StoreResult};
use crate::message::ChangeMessage;
use crate::record::ChangeRecord;
use crate::store::BATCH_KEY;
use crate::PropStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchAction {
    Set { key: String, value: Value },
    /// Write only if the slot holds no value yet
    Init { key: String, value: Value },
    Delete { keys: Vec<String> },
    Batch { actions: Vec<BatchAction> },
}

/// What [`PropStore::batch`] accepts
#[derive(Debug, Clone, PartialEq)]
pub enum BatchInput {
    /// Key to value, each entry a plain set
    Map(Map<String, Value>),
    Actions(Vec<BatchAction>),
}

impl BatchInput {
    /// Accept a JSON object as a map or a JSON array as a list of actions
    pub fn from_json(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(BatchInput::Map(map)),
            other => serde_json::from_value(other)
                .map(BatchInput::Actions)
                .map_err(|source| StoreError::Deserialize {
                    key: BATCH_KEY.to_string(),
                    source,
                }),
        }
    }
}

impl From<Map<String, Value>> for BatchInput {
    fn from(map: Map<String, Value>) -> Self {
        BatchInput::Map(map)
    }
}

impl From<Vec<BatchAction>> for BatchInput {
    fn from(actions: Vec<BatchAction>) -> Self {
        BatchInput::Actions(actions)
    }
}

impl PropStore {
    /// Remove every key that currently holds a value.
    ///
    /// Each removal runs the full protocol without formatter or validator.
    /// One aggregate event on [`BATCH_KEY`] lists the records, unless no key
    /// held a value.
    pub fn remove<I, K>(&self, keys: I, message: impl Into<ChangeMessage>) -> Vec<ChangeRecord>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let message = message.into();
        let records = self.remove_each(keys, &message);
        if !records.is_empty() {
            self.announce_batch(&records, &message);
        }
        records
    }

    /// Apply a group of writes, then fire one aggregate event if any of
    /// them changed a value.
    ///
    /// The returned records hold one net entry per key, placed where the key
    /// was last written. It spans from the value before the batch to the
    /// value after it.
    pub fn batch(
        &self,
        input: impl Into<BatchInput>,
        message: impl Into<ChangeMessage>,
    ) -> Vec<ChangeRecord> {
        let message = message.into();
        let mut records = Vec::new();
        match input.into() {
            BatchInput::Map(map) => {
                for (key, value) in map {
                    records.push(self.apply(&key, Some(value), message.plain()));
                }
            }
            BatchInput::Actions(actions) => self.run_actions(actions, &message, 1, &mut records),
        }

        let any_changed = records.iter().any(ChangeRecord::is_changed);
        let records = net_per_key(records);
        if any_changed {
            self.announce_batch(&records, &message);
        }
        records
    }

    fn run_actions(
        &self,
        actions: Vec<BatchAction>,
        message: &ChangeMessage,
        depth: usize,
        out: &mut Vec<ChangeRecord>,
    ) {
        for action in actions {
            match action {
                BatchAction::Set { key, value } => {
                    out.push(self.apply(&key, Some(value), message.plain()));
                }
                BatchAction::Init { key, value } => {
                    let init = ChangeMessage {
                        init: true,
                        ..message.clone()
                    };
                    out.push(self.apply(&key, Some(value), init));
                }
                BatchAction::Delete { keys } => out.extend(self.remove_each(keys, message)),
                BatchAction::Batch { actions } => {
                    if depth >= self.inner.config.max_batch_depth {
                        tracing::warn!(
                            store = %self.inner.config.name,
                            depth,
                            skipped = actions.len(),
                            "nested batch too deep"
                        );
                        continue;
                    }
                    self.run_actions(actions, message, depth + 1, out);
                }
            }
        }
    }

    fn remove_each<I, K>(&self, keys: I, message: &ChangeMessage) -> Vec<ChangeRecord>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        keys.into_iter()
            .filter(|key| self.current_value(key.as_ref()).is_some())
            .map(|key| self.apply(key.as_ref(), None, message.plain()))
            .collect()
    }

    fn announce_batch(&self, records: &[ChangeRecord], message: &ChangeMessage) {
        self.inner
            .events
            .batch
            .fire(BATCH_KEY, records.to_vec(), message.fire_meta());
    }
}

fn net_per_key(records: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut out: Vec<ChangeRecord> = Vec::with_capacity(records.len());
    for record in records {
        match out.iter().position(|r| r.key == record.key) {
            Some(at) => {
                let earlier = out.remove(at);
                out.push(earlier.then(record));
            }
            None => out.push(record),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::error::ChangeError;
    use crate::record::ChangeAction;
    use propflow_timing::ManualScheduler;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn store() -> PropStore {
        PropStore::new(ManualScheduler::new().shared())
    }

    fn batches(store: &PropStore) -> Arc<Mutex<Vec<Vec<String>>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        store.on_props_changed(move |records, _| {
            sink.lock()
                .unwrap()
                .push(records.iter().map(|r| r.key.clone()).collect())
        });
        log
    }

    #[test]
    fn test_remove_only_present_keys() {
        let store = store();
        let log = batches(&store);
        store.set("a", json!(1), ChangeMessage::default());
        store.set("b", json!(2), ChangeMessage::default());

        let records = store.remove(["a", "missing", "b"], "cleanup");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.action == ChangeAction::Remove));
        assert!(store.get_prop_keys().is_empty());
        assert_eq!(*log.lock().unwrap(), vec![vec!["a", "b"]]);

        assert!(store.remove(["a"], "again").is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_skips_validator() {
        let store = store();
        store.set("a", json!(1), ChangeMessage::default());
        store.set_validator(|_, _| false);
        let records = store.remove(vec!["a".to_string()], ChangeMessage::default());
        assert!(records[0].success);
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn test_batch_map_fires_once() {
        let store = store();
        let log = batches(&store);
        let mut map = Map::new();
        map.insert("x".into(), json!(1));
        map.insert("y".into(), json!(2));

        let records = store.batch(map.clone(), "load");
        assert_eq!(records.len(), 2);
        assert_eq!(log.lock().unwrap().len(), 1);

        // Nothing changes the second time
        store.batch(map, "load");
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_batch_keeps_last_record_per_key() {
        let store = store();
        let actions = vec![
            BatchAction::Set { key: "a".into(), value: json!(1) },
            BatchAction::Set { key: "b".into(), value: json!(1) },
            BatchAction::Set { key: "a".into(), value: json!(2) },
        ];
        let records = store.batch(actions, ChangeMessage::default());
        let keys: Vec<_> = records.iter().map(|r| (r.key.as_str(), r.value.clone())).collect();
        assert_eq!(keys, vec![("b", Some(json!(1))), ("a", Some(json!(2)))]);
    }

    #[test]
    fn test_batch_reports_net_change_per_key() {
        let repeated = vec![
            BatchAction::Set { key: "a".into(), value: json!(1) },
            BatchAction::Set { key: "a".into(), value: json!(1) },
        ];
        let refused_init = vec![
            BatchAction::Set { key: "a".into(), value: json!(1) },
            BatchAction::Init { key: "a".into(), value: json!(2) },
        ];
        for actions in [repeated, refused_init] {
            let store = store();
            let log = batches(&store);
            let records = store.batch(actions, ChangeMessage::default());

            assert_eq!(records.len(), 1);
            let record = &records[0];
            assert!(record.success);
            assert_eq!(record.action, ChangeAction::Add);
            assert_eq!(record.old_value, None);
            assert_eq!(record.value, Some(json!(1)));
            assert_eq!(record.value_request, Some(json!(1)));
            assert_eq!(*log.lock().unwrap(), vec![vec!["a"]]);
        }
    }

    #[test]
    fn test_batch_actions_from_json() {
        let store = store();
        store.set("old", json!(true), ChangeMessage::default());
        store.set("kept", json!(1), ChangeMessage::default());
        let input = BatchInput::from_json(json!([
            {"type": "init", "key": "kept", "value": 5},
            {"type": "delete", "keys": ["old"]},
            {"type": "batch", "actions": [{"type": "set", "key": "inner", "value": "v"}]}
        ]))
        .unwrap();

        let records = store.batch(input, ChangeMessage::default());
        assert_eq!(records[0].error, Some(ChangeError::Ignore));
        assert_eq!(store.get("kept"), Some(json!(1)));
        assert_eq!(store.get("old"), None);
        assert_eq!(store.get("inner"), Some(json!("v")));
        assert!(BatchInput::from_json(json!("nope")).is_err());
    }

    #[test]
    fn test_nested_batch_depth_limit() {
        let config = StoreConfig {
            max_batch_depth: 2,
            ..StoreConfig::default()
        };
        let store = PropStore::with_config(config, ManualScheduler::new().shared());
        let deep = BatchAction::Batch {
            actions: vec![BatchAction::Batch {
                actions: vec![BatchAction::Set { key: "deep".into(), value: json!(1) }],
            }],
        };
        let shallow = BatchAction::Batch {
            actions: vec![BatchAction::Set { key: "shallow".into(), value: json!(1) }],
        };
        store.batch(vec![deep, shallow], ChangeMessage::default());
        assert_eq!(store.get("deep"), None);
        assert_eq!(store.get("shallow"), Some(json!(1)));
    }
}
