use std::collections::HashMap;

use livequery::{Method, Notification, ObserveOptions};
use serde_json::{json, Map};

use crate::support::{doc, Fixture};

#[test]
fn insert_remove_then_stale_update() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})));
    assert_eq!(rec.take(), vec![r#"added a {"x":1}"#]);

    fx.publish(Notification::insert("b", json!({ "x": 2 }), 1));
    assert_eq!(rec.take(), vec![r#"added b {"x":2}"#]);

    fx.publish(Notification::remove("b", 2));
    assert_eq!(rec.take(), vec!["removed b"]);

    fx.publish(Notification::update("b", json!({ "$set": { "x": 3 } }), 1));
    assert!(rec.take().is_empty());
    assert_eq!(handle.snapshot().ids(), vec!["a"]);
}

#[test]
fn stale_remove_after_insert_is_ignored() {
    let fx = Fixture::new(vec![]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})));

    fx.publish(Notification::insert("a", json!({ "x": 1 }), 10));
    fx.publish(Notification::remove("a", 9));

    assert_eq!(rec.take(), vec![r#"added a {"x":1}"#]);
    assert!(handle.snapshot().contains("a"));
}

#[test]
fn redelivery_is_idempotent() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (_handle, rec) = fx.observe(ObserveOptions::new(json!({})));
    rec.take();

    fx.store.update("a", &json!({ "$set": { "x": 5 } })).unwrap();
    let n = Notification::update("a", json!({ "$set": { "x": 5 } }), 1);
    fx.publish(n.clone());
    fx.publish(n);

    assert_eq!(rec.take(), vec![r#"changed a {"x":5}"#]);
}

#[test]
fn identical_streams_yield_identical_events() {
    let script = vec![
        Notification::insert("b", json!({ "x": 2, "tag": "t" }), 1),
        Notification::update("a", json!({ "$inc": { "x": 10 } }), 2),
        Notification::update("b", json!({ "$unset": { "tag": 1 } }), 3),
        Notification::remove("a", 4),
        Notification::update("a", json!({ "$set": { "x": 0 } }), 3),
    ];

    let run = || {
        let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
        let (handle, rec) = fx.observe(ObserveOptions::new(json!({})));
        for n in &script {
            fx.publish(n.clone());
        }
        (rec.lines(), handle.snapshot().documents())
    };

    let (first_events, first_cache) = run();
    let (second_events, second_cache) = run();
    assert_eq!(first_events, second_events);
    assert_eq!(first_cache, second_cache);
    assert_eq!(
        first_events,
        vec![
            r#"added a {"x":1}"#,
            r#"added b {"tag":"t","x":2}"#,
            r#"changed a {"x":11}"#,
            r#"changed b {"tag":null}"#,
            "removed a",
        ]
    );
}

/// Replays recorder lines per id and checks each id runs
/// `added (changed)* removed` cycles. Returns which ids end up present.
fn assert_lifecycle_ordered(lines: &[String]) -> HashMap<String, bool> {
    let mut present: HashMap<String, bool> = HashMap::new();
    for line in lines {
        let mut parts = line.splitn(3, ' ');
        let (kind, id) = (parts.next().unwrap(), parts.next().unwrap());
        let live = present.entry(id.to_string()).or_insert(false);
        match kind {
            "added" => {
                assert!(!*live, "{id} added twice: {lines:?}");
                *live = true;
            }
            "changed" => assert!(*live, "{id} changed while absent: {lines:?}"),
            "removed" => {
                assert!(*live, "{id} removed while absent: {lines:?}");
                *live = false;
            }
            other => panic!("unexpected event {other}"),
        }
    }
    present
}

#[test]
fn shuffled_streams_keep_each_lifecycle_in_order() {
    // xorshift, so every run replays the same streams
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move |bound: u64| {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed % bound
    };

    for _ in 0..20 {
        let fx = Fixture::new(vec![json!({ "_id": "a", "x": 0 })]);
        let (handle, rec) = fx.observe(ObserveOptions::new(json!({})));
        for _ in 0..60 {
            let id = ["a", "b", "c"][next(3) as usize];
            let ts = 1 + next(12);
            let n = match next(3) {
                0 => Notification::insert(id, json!({ "x": ts }), ts),
                1 => Notification::update(id, json!({ "$inc": { "x": 1 } }), ts),
                _ => Notification::remove(id, ts),
            };
            fx.publish(n);
        }

        let lines = rec.lines();
        let present = assert_lifecycle_ordered(&lines);
        assert_eq!(lines.first().map(String::as_str), Some(r#"added a {"x":0}"#));
        for id in ["a", "b", "c"] {
            let live = present.get(id).copied().unwrap_or(false);
            assert_eq!(handle.snapshot().contains(id), live, "{id}: {lines:?}");
        }
        handle.stop();
    }
}

#[test]
fn update_leaving_selector_removes() {
    let fx = Fixture::new(vec![
        json!({ "_id": "a", "status": "open" }),
        json!({ "_id": "b", "status": "open" }),
    ]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({ "status": "open" })));
    rec.take();

    fx.publish(Notification::update("a", json!({ "$set": { "status": "closed" } }), 1));

    assert_eq!(rec.take(), vec!["removed a"]);
    assert_eq!(handle.snapshot().ids(), vec!["b"]);
}

#[test]
fn unknown_id_is_fetched_from_the_store() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "status": "closed" })]);
    let (_handle, rec) = fx.observe(ObserveOptions::new(json!({ "status": "open" })));
    assert!(rec.take().is_empty());

    fx.store.update("a", &json!({ "$set": { "status": "open" } })).unwrap();
    fx.publish(Notification::update("a", json!({ "$set": { "status": "open" } }), 1));

    assert_eq!(rec.take(), vec![r#"added a {"status":"open"}"#]);
    assert_eq!(fx.store.stats().find_ones, 1);
}

#[test]
fn notification_doc_is_used_as_is() {
    let fx = Fixture::new(vec![]);
    let (_handle, rec) = fx.observe(ObserveOptions::new(json!({})));

    let n = Notification::update("z", json!({ "$set": { "x": 1 } }), 1)
        .with_doc(doc(json!({ "x": 1, "y": 2 })));
    fx.publish(n);

    assert_eq!(rec.take(), vec![r#"added z {"x":1,"y":2}"#]);
    assert_eq!(fx.store.stats().find_ones, 0);
}

#[test]
fn disconnected_selector_update_touches_matching_cached_docs() {
    let fx = Fixture::new(vec![
        json!({ "_id": "a", "team": "red", "score": 1 }),
        json!({ "_id": "b", "team": "blue", "score": 1 }),
        json!({ "_id": "c", "team": "red", "score": 2 }),
    ]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})));
    rec.take();
    let before = fx.store.stats();

    fx.publish(
        Notification::by_selector(
            Method::Update,
            json!({ "team": "red" }),
            Some(json!({ "$inc": { "score": 10 } })),
            1,
        )
        .disconnected(),
    );

    assert_eq!(
        rec.take(),
        vec![r#"changed a {"score":11}"#, r#"changed c {"score":12}"#]
    );
    assert_eq!(fx.store.stats(), before);
    assert_eq!(handle.snapshot().get("b").unwrap()["score"], json!(1));
}

#[test]
fn disconnected_update_is_trusted_without_store_check() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({ "x": 1 })));
    rec.take();

    fx.publish(Notification::update("a", json!({ "$set": { "x": 2 } }), 1).disconnected());

    assert_eq!(rec.take(), vec![r#"changed a {"x":2}"#]);
    assert!(handle.snapshot().contains("a"));
}

#[test]
fn mixin_fields_are_delivered_but_not_over_modifier_writes() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let mut mixin = Map::new();
    mixin.insert("kind".to_string(), json!("task"));
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})).mixin_fields(mixin));
    assert_eq!(rec.take(), vec![r#"added a {"kind":"task","x":1}"#]);

    fx.publish(Notification::update("a", json!({ "$set": { "kind": "note", "x": 2 } }), 1));
    assert_eq!(rec.take(), vec![r#"changed a {"kind":"note","x":2}"#]);

    fx.publish(Notification::update("a", json!({ "$set": { "x": 3 } }), 2));
    assert_eq!(rec.take(), vec![r#"changed a {"kind":"task","x":3}"#]);
    assert_eq!(handle.snapshot().get("a").unwrap()["kind"], json!("task"));
}

#[test]
fn projection_hides_fields_and_suppresses_empty_changes() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "name": "n", "secret": 1 })]);
    let mut fields = Map::new();
    fields.insert("name".to_string(), json!(1));
    let (handle, rec) = fx.observe(ObserveOptions::new(json!({})).fields(fields));
    assert_eq!(rec.take(), vec![r#"added a {"name":"n"}"#]);

    fx.publish(Notification::update("a", json!({ "$set": { "secret": 2 } }), 1));
    assert!(rec.take().is_empty());
    assert_eq!(handle.snapshot().get("a").unwrap()["secret"], json!(2));

    fx.publish(Notification::update("a", json!({ "$set": { "name": "m" } }), 2));
    assert_eq!(rec.take(), vec![r#"changed a {"name":"m"}"#]);
}

#[test]
fn store_failure_skips_only_that_notification() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (_handle, rec) = fx.observe(ObserveOptions::new(json!({})));
    rec.take();

    fx.store.set_available(false);
    fx.publish(Notification::update("zz", json!({ "$set": { "x": 1 } }), 1));
    assert!(rec.take().is_empty());

    fx.store.set_available(true);
    fx.publish(Notification::update("a", json!({ "$set": { "x": 2 } }), 2));
    assert_eq!(rec.take(), vec![r#"changed a {"x":2}"#]);
}

#[test]
fn wire_payloads_are_understood() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (_handle, rec) = fx.observe(ObserveOptions::new(json!({})));
    rec.take();

    fx.messenger
        .publish_json(
            "items",
            r#"{"id":"a","method":"update","modifier":{"$set":{"x":4}},"ts":7,"withoutMongo":true}"#,
        )
        .unwrap();

    assert_eq!(rec.take(), vec![r#"changed a {"x":4}"#]);
}
