use std::sync::{Arc, Mutex};

use livequery::error::{ConfigError, LiveQueryError};
use livequery::{Callbacks, Listener, Notification, ObserveHandle, ObserveOptions};
use serde_json::{json, Map};

use crate::support::{Fixture, Recorder};

#[test]
fn stop_ends_delivery() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})));
    handle.stop();
    assert!(handle.is_stopped());

    fx.publish(Notification::update("a", json!({ "$set": { "x": 2 } }), 1));
    assert_eq!(rec.lines(), vec![r#"added a {"x":1}"#]);
    assert_eq!(fx.registry.observer_count(), 0);
}

#[test]
fn paused_observer_queues_then_drains_in_order() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})));
    rec.take();
    let observer = handle.observer();

    observer.pause();
    assert!(observer.is_paused());
    fx.publish(Notification::update("a", json!({ "$set": { "x": 2 } }), 1));
    fx.publish(Notification::insert("b", json!({ "x": 5 }), 2));
    assert!(rec.take().is_empty());
    assert_eq!(observer.queued(), 2);

    observer.resume();
    assert!(!observer.is_paused());
    assert_eq!(observer.queued(), 0);
    assert_eq!(rec.take(), vec![r#"changed a {"x":2}"#, r#"added b {"x":5}"#]);
}

#[test]
fn listener_may_stop_itself_from_a_callback() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let slot: Arc<Mutex<Option<ObserveHandle>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (slot_cb, seen_cb) = (Arc::clone(&slot), Arc::clone(&seen));
    let listener = Callbacks::new().changed(move |id, _| {
        seen_cb.lock().unwrap().push(id.to_string());
        if let Some(handle) = slot_cb.lock().unwrap().take() {
            handle.stop();
        }
    });
    let handle = fx
        .registry
        .subscribe(fx.store.clone(), ObserveOptions::new(json!({})), Arc::new(listener))
        .unwrap();
    *slot.lock().unwrap() = Some(handle);

    fx.publish(Notification::update("a", json!({ "$set": { "x": 2 } }), 1));
    fx.publish(Notification::update("a", json!({ "$set": { "x": 3 } }), 2));

    assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    assert_eq!(fx.registry.observer_count(), 0);
    assert_eq!(fx.messenger.observer_count("items"), 0);
}

#[test]
fn subscribing_from_a_callback_attaches_after_the_current_round() {
    let fx = Arc::new(Fixture::new(vec![
        json!({ "_id": "a", "x": 1 }),
        json!({ "_id": "b", "x": 2 }),
    ]));
    let late = Recorder::new();
    let handles: Arc<Mutex<Vec<ObserveHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let order = Arc::new(Mutex::new(Vec::new()));

    let (fx_cb, late_cb, handles_cb, order_cb) = (
        Arc::clone(&fx),
        Arc::clone(&late),
        Arc::clone(&handles),
        Arc::clone(&order),
    );
    let first = Callbacks::new().added(move |id, _| {
        order_cb.lock().unwrap().push(format!("first {id}"));
        let mut handles = handles_cb.lock().unwrap();
        if handles.is_empty() {
            let listener: Arc<dyn Listener> = late_cb.clone();
            let handle = fx_cb
                .registry
                .subscribe(fx_cb.store.clone(), ObserveOptions::new(json!({})), listener)
                .unwrap();
            handles.push(handle);
        }
    });
    let handle = fx
        .registry
        .subscribe(fx.store.clone(), ObserveOptions::new(json!({})), Arc::new(first))
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first a", "first b"]);
    assert_eq!(late.take(), vec![r#"added a {"x":1}"#, r#"added b {"x":2}"#]);
    assert_eq!(fx.registry.ref_count(handle.signature()), 2);
    assert_eq!(fx.store.stats().finds, 1);

    fx.publish(Notification::remove("a", 1));
    assert_eq!(late.take(), vec!["removed a"]);
}

#[test]
fn panicking_listener_does_not_starve_others() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let _bad = fx
        .registry
        .subscribe(
            fx.store.clone(),
            ObserveOptions::new(json!({})),
            Arc::new(Callbacks::new().changed(|_, _| panic!("listener bug"))),
        )
        .unwrap();
    let (_good, rec) = fx.observe(ObserveOptions::new(json!({})));
    rec.take();

    fx.publish(Notification::update("a", json!({ "$set": { "x": 2 } }), 1));
    assert_eq!(rec.take(), vec![r#"changed a {"x":2}"#]);
}

#[test]
fn observer_without_store_builds_from_notifications() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})).without_store(true));
    assert!(rec.take().is_empty());
    assert_eq!(fx.store.stats().finds, 0);

    fx.publish(Notification::insert("b", json!({ "x": 2 }), 1));
    assert_eq!(rec.take(), vec![r#"added b {"x":2}"#]);
    assert_eq!(handle.snapshot().ids(), vec!["b"]);
}

#[test]
fn custom_channel_isolates_notifications() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (_handle, rec) = fx.observe(ObserveOptions::new(json!({})).channel("items::a"));
    rec.take();

    fx.publish(Notification::update("a", json!({ "$set": { "x": 2 } }), 1));
    assert!(rec.take().is_empty());

    fx.messenger.publish(
        "items::a",
        &Notification::update("a", json!({ "$set": { "x": 3 } }), 2),
    );
    assert_eq!(rec.take(), vec![r#"changed a {"x":3}"#]);
}

#[test]
fn projections_that_cannot_be_observed_are_rejected() {
    let fx = Fixture::new(vec![]);

    let mut mixed = Map::new();
    mixed.insert("a".to_string(), json!(1));
    mixed.insert("b".to_string(), json!(0));
    let err = fx
        .registry
        .subscribe(
            fx.store.clone(),
            ObserveOptions::new(json!({})).fields(mixed),
            Recorder::new(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LiveQueryError::Config(ConfigError::MixedProjection { .. })
    ));

    let mut no_id = Map::new();
    no_id.insert("_id".to_string(), json!(0));
    let err = fx
        .registry
        .subscribe(
            fx.store.clone(),
            ObserveOptions::new(json!({})).fields(no_id),
            Recorder::new(),
        )
        .unwrap_err();
    assert!(matches!(err, LiveQueryError::Config(ConfigError::IdExcluded)));
    assert_eq!(fx.registry.observer_count(), 0);
}
