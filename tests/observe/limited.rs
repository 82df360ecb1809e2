use std::sync::Arc;

use livequery::error::StoreError;
use livequery::projection::Projection;
use livequery::query::execute::execute_find;
use livequery::query::operators::Matcher;
use livequery::query::types::{FindOptions, SortEntry};
use livequery::store::DocumentStore;
use livequery::types::Document;
use livequery::{LocalMessenger, Notification, ObserveHandle, ObserveOptions, Registry};
use serde_json::{json, Value};

use crate::support::{doc, Fixture, Recorder, CHANNEL};

/// A backend that keeps whatever `_id` values it is given.
struct LooseStore {
    docs: Vec<Document>,
}

impl DocumentStore for LooseStore {
    fn name(&self) -> &str {
        CHANNEL
    }

    fn find(&self, selector: &Value, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
        let matcher = Matcher::compile(selector).map_err(|source| StoreError::Query {
            store: CHANNEL.to_string(),
            source,
        })?;
        let projection = Projection::compile(&options.fields).map_err(|e| StoreError::Backend(Box::new(e)))?;
        Ok(execute_find(self.docs.clone(), &matcher, options)
            .iter()
            .map(|d| projection.apply(d))
            .collect())
    }
}

fn top_two() -> ObserveOptions {
    ObserveOptions::new(json!({}))
        .sort(vec![SortEntry::asc("x")])
        .limit(2)
}

fn assert_window_matches_store(fx: &Fixture, handle: &ObserveHandle, options: &ObserveOptions) {
    let find = FindOptions {
        sort: options.options.sort.clone(),
        limit: options.options.limit,
        skip: options.options.skip,
        ..Default::default()
    };
    let mut expected = fx.store.find_ids(&options.selector, &find).unwrap();
    expected.sort();
    assert_eq!(handle.snapshot().ids(), expected);
}

#[test]
fn window_tracks_authoritative_membership() {
    let fx = Fixture::new(vec![
        json!({ "_id": "a", "x": 1 }),
        json!({ "_id": "b", "x": 2 }),
        json!({ "_id": "c", "x": 3 }),
    ]);
    let (handle, rec) = fx.observe(top_two());
    assert_eq!(rec.take(), vec![r#"added a {"x":1}"#, r#"added b {"x":2}"#]);
    assert!(handle.observer().refreshes_authoritatively());

    fx.store.put(doc(json!({ "_id": "d", "x": 0 })));
    fx.publish(Notification::insert("d", json!({ "x": 0 }), 1));
    assert_eq!(rec.take(), vec![r#"added d {"x":0}"#, "removed b"]);
    assert_window_matches_store(&fx, &handle, &top_two());

    fx.store.remove("a");
    fx.publish(Notification::remove("a", 2));
    assert_eq!(rec.take(), vec!["removed a", r#"added b {"x":2}"#]);
    assert_window_matches_store(&fx, &handle, &top_two());

    fx.store.update("c", &json!({ "$set": { "x": 4 } })).unwrap();
    fx.publish(Notification::update("c", json!({ "$set": { "x": 4 } }), 3));
    assert!(rec.take().is_empty());
    assert_window_matches_store(&fx, &handle, &top_two());

    fx.store.update("b", &json!({ "$set": { "x": -1 } })).unwrap();
    fx.publish(Notification::update("b", json!({ "$set": { "x": -1 } }), 4));
    assert_eq!(rec.take(), vec![r#"changed b {"x":-1}"#]);
    assert_window_matches_store(&fx, &handle, &top_two());
}

#[test]
fn skip_shifts_the_window() {
    let fx = Fixture::new(vec![
        json!({ "_id": "a", "x": 1 }),
        json!({ "_id": "b", "x": 2 }),
        json!({ "_id": "c", "x": 3 }),
    ]);
    let options = top_two().limit(1).skip(1);
    let (handle, rec) = fx.observe(options.clone());
    assert_eq!(rec.take(), vec![r#"added b {"x":2}"#]);

    fx.store.put(doc(json!({ "_id": "d", "x": 0 })));
    fx.publish(Notification::insert("d", json!({ "x": 0 }), 1));

    assert_eq!(rec.take(), vec!["removed b", r#"added a {"x":1}"#]);
    assert_window_matches_store(&fx, &handle, &options);
}

#[test]
fn lazy_limit_skips_the_refresh() {
    let fx = Fixture::new(vec![
        json!({ "_id": "a", "x": 1 }),
        json!({ "_id": "b", "x": 2 }),
        json!({ "_id": "c", "x": 3 }),
    ]);
    let (handle, rec) = fx.observe(top_two().lazy_limit(true));
    rec.take();
    assert!(!handle.observer().refreshes_authoritatively());

    fx.store.put(doc(json!({ "_id": "d", "x": 0 })));
    fx.publish(Notification::insert("d", json!({ "x": 0 }), 1));

    assert_eq!(rec.take(), vec![r#"added d {"x":0}"#]);
    assert_eq!(handle.snapshot().ids(), vec!["a", "b", "d"]);
    assert_eq!(fx.store.stats().find_ids, 0);
}

#[test]
fn sort_alone_is_ordering_dependent() {
    let fx = Fixture::new(vec![json!({ "_id": "a", "x": 1 })]);
    let (sorted, _) = fx.observe(ObserveOptions::new(json!({})).sort(vec![SortEntry::desc("x")]));
    let (plain, _) = fx.observe(ObserveOptions::new(json!({})));
    assert!(sorted.observer().refreshes_authoritatively());
    assert!(!plain.observer().refreshes_authoritatively());
}

#[test]
fn numeric_ids_never_enter_the_window() {
    let store = Arc::new(LooseStore {
        docs: vec![
            doc(json!({ "_id": 1, "x": 1 })),
            doc(json!({ "_id": "2", "x": 2 })),
            doc(json!({ "_id": "3", "x": 3 })),
        ],
    });
    let messenger = Arc::new(LocalMessenger::new());
    let registry = Registry::new(messenger.clone());
    let rec = Recorder::new();
    let handle = registry
        .subscribe(store.clone(), top_two(), rec.clone())
        .unwrap();
    assert_eq!(rec.take(), vec![r#"added 2 {"x":2}"#]);

    // the repeat is stale
    messenger.publish(CHANNEL, &Notification::update("1", json!({ "$set": { "y": 1 } }), 1));
    messenger.publish(CHANNEL, &Notification::update("1", json!({ "$set": { "y": 1 } }), 1));

    assert!(rec.take().is_empty());
    let authoritative = store.find_ids(&json!({}), &top_two().options).unwrap();
    assert_eq!(authoritative, vec!["2"]);
    assert_eq!(handle.snapshot().ids(), authoritative);
}
