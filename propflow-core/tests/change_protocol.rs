//! End-to-end runs of the change protocol through the public API

use propflow_core::{
    CacheOptions, ChangeAction, ChangeError, ChangeMessage, ChangeRecord, PropStore, StoreConfig,
};
use propflow_timing::{ManualScheduler, TokioScheduler};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn record_changes(store: &PropStore) -> Arc<Mutex<Vec<ChangeRecord>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    store.on_any_changed(move |record, _| sink.lock().unwrap().push(record.clone()));
    log
}

#[test]
fn set_repeat_and_remove() {
    init_tracing();
    let store = PropStore::new(ManualScheduler::new().shared());
    let changes = record_changes(&store);

    let first = store.set("name", json!("abc"), ChangeMessage::default());
    assert!(first.success);
    assert_eq!(store.get("name"), Some(json!("abc")));

    let repeat = store.set("name", json!("abc"), ChangeMessage::default());
    assert!(repeat.success);
    assert_eq!(repeat.action, ChangeAction::None);

    let removed = store.remove(["name"], ChangeMessage::default());
    assert_eq!(removed.len(), 1);
    assert_eq!(store.get("name"), None);

    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 2);
    let last = &changes[1];
    assert_eq!(last.action, ChangeAction::Remove);
    assert_eq!(last.value, None);
    assert_eq!(last.old_value, Some(json!("abc")));
}

#[test]
fn two_phase_resolve_with_different_value() {
    init_tracing();
    let store = PropStore::new(ManualScheduler::new().shared());
    let changes = record_changes(&store);

    let change = store.customized_set("n", json!("req"), ChangeMessage::default());
    assert_eq!(store.get("n"), None);
    assert!(changes.lock().unwrap().is_empty());

    change.resolve(json!("final"));
    assert_eq!(store.get("n"), Some(json!("final")));

    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].value_request, Some(json!("req")));
    assert_eq!(changes[0].value, Some(json!("final")));
}

#[test]
fn message_metadata_reaches_listeners() {
    let store = PropStore::new(ManualScheduler::new().shared());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    store.on_changed("n", move |_, ctx| {
        sink.lock().unwrap().push((
            ctx.message().map(str::to_string),
            ctx.source().map(str::to_string),
            ctx.addition().cloned(),
        ))
    });

    let message = ChangeMessage::new()
        .with_message("typed")
        .with_source("form")
        .with_addition(json!({"field": 3}));
    store.set("n", json!(1), message);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(
            Some("typed".to_string()),
            Some("form".to_string()),
            Some(json!({"field": 3}))
        )]
    );
}

#[test]
fn superseded_attempt_rejects_its_resolution() {
    let store = PropStore::new(ManualScheduler::new().shared());
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    store.on_changing("k", move |proposal, _| {
        let ok = sink.clone();
        let err = sink.clone();
        let requested = proposal.value_request.clone();
        proposal
            .resolution
            .on_resolved(move |r| ok.lock().unwrap().push((requested.clone(), "ok", r.error)));
        let requested = proposal.value_request.clone();
        proposal
            .resolution
            .on_rejected(move |r| err.lock().unwrap().push((requested, "err", r.error)));
    });

    let first = store.customized_set("k", json!(1), ChangeMessage::default());
    store.set("k", json!(2), ChangeMessage::default());
    assert_eq!(first.resolve(json!(1)).error, Some(ChangeError::Expired));

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![
            (Some(json!(1)), "err", Some(ChangeError::Expired)),
            (Some(json!(2)), "ok", None),
        ]
    );
}

#[test]
fn default_expiry_from_config() {
    let scheduler = ManualScheduler::new();
    let config = StoreConfig::from_yaml_str("default_expires_in_ms: 1000\n").unwrap();
    let store = PropStore::with_config(config, scheduler.shared());

    store.set("session", json!("s"), ChangeMessage::default());
    let pinned = ChangeMessage::new().with_cache(CacheOptions::new().format_rev(1));
    store.set("pinned", json!("p"), pinned);

    scheduler.advance(Duration::from_millis(1000));
    assert_eq!(store.get("session"), None);
    assert_eq!(store.get("pinned"), Some(json!("p")));
    assert_eq!(store.get_prop_keys(), vec!["pinned"]);
}

#[test]
fn details_report_slot_state() {
    let store = PropStore::new(ManualScheduler::new().shared());
    store.set("k", json!([1, 2]), ChangeMessage::default());
    store.register_request_handler("k", "append", |_, _| {});
    let _pending = store.customized_set("k", json!([3]), ChangeMessage::default());

    let details = store.get_details("k").unwrap();
    assert!(details.has_value);
    assert!(details.pending);
    assert_eq!(details.request_types, vec!["append"]);

    let encoded = serde_json::to_value(&details).unwrap();
    assert_eq!(encoded["value"], json!([1, 2]));
}

#[tokio::test(start_paused = true)]
async fn resolution_can_be_awaited() {
    init_tracing();
    let scheduler = TokioScheduler::current().unwrap();
    let store = PropStore::new(Arc::new(scheduler));
    let change = store.customized_set("n", json!(1), ChangeMessage::default());
    let resolution = change.resolution().cloned().unwrap();

    let waiter = tokio::spawn(async move { resolution.wait().await });
    tokio::task::yield_now().await;
    change.resolve(Value::from(2));

    let outcome = waiter.await.unwrap();
    let record = outcome.unwrap().unwrap();
    assert_eq!(record.value, Some(json!(2)));
    assert_eq!(store.get("n"), Some(json!(2)));
}
