//! Integration tests for the sync engine.

mod common;

use common::{doc, ids, named_docs, query, MockStore};
use livequery::{
    query_key, CacheBinding, EngineConfig, ListenerState, MemoryCache, QueryOptions, QueryRef,
    QueryStatus, Reference, ResultSnapshot, Snapshot, SnapshotMetadata, Source, SyncEngine,
};
use serde_json::json;
use std::sync::Arc;

const PAGE_SIZE: usize = 2;

fn setup() -> (Arc<MockStore>, Arc<MemoryCache>, SyncEngine) {
    common::init_tracing();
    let store = MockStore::new("default");
    let cache = Arc::new(MemoryCache::new());
    let engine = SyncEngine::new(store.clone(), cache.clone());
    (store, cache, engine)
}

fn page_ref(after: Option<&str>) -> QueryRef {
    QueryRef::query("products", json!({ "order_by": "name", "after": after, "limit": PAGE_SIZE }))
}

/// Next page starts after the last record of a full page.
fn next_page(snapshot: &ResultSnapshot) -> Option<QueryRef> {
    let records = snapshot.records()?;
    if records.len() < PAGE_SIZE {
        return None;
    }
    let last = records.last()?.get("id")?.as_str()?;
    Some(page_ref(Some(last)))
}

fn extracted_ids(snapshot: &ResultSnapshot) -> Vec<String> {
    ids(snapshot.records().unwrap(), "id")
}

// --- One-shot Reads ---

#[tokio::test]
async fn test_read_extracts_records_with_ids() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::collection("products");
    store.set_snapshot(&reference, named_docs(&["boots", "sandals"]));

    let handle = engine
        .read(
            query_key!["products"],
            reference,
            QueryOptions::default().with_id_field("id"),
        )
        .await
        .unwrap();

    assert_eq!(handle.status(), QueryStatus::Success);
    let snapshot = handle.snapshot().unwrap();
    assert_eq!(extracted_ids(&snapshot), vec!["boots", "sandals"]);
    assert_eq!(snapshot.records().unwrap()[0]["name"], "boots");
    assert_eq!(handle.state().data_update_count, 1);
    assert_eq!(store.read_count(), 1);
}

#[tokio::test]
async fn test_read_passes_source_through() {
    let (store, _cache, engine) = setup();

    let _handle = engine
        .read(
            query_key!["products", "cached"],
            QueryRef::collection("products"),
            QueryOptions::default().with_source(Source::Cache),
        )
        .await
        .unwrap();

    assert_eq!(store.last_source(), Some(Source::Cache));
}

#[tokio::test]
async fn test_raw_shape_keeps_snapshot_metadata() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::document("users/alice");
    let mut alice = doc("alice", json!({"name": "Alice"}));
    alice.metadata = SnapshotMetadata {
        from_cache: true,
        has_pending_writes: false,
    };
    store.set_snapshot(&reference, Snapshot::Document(alice.clone()));

    let handle = engine
        .read(query_key!["users", "alice"], reference, QueryOptions::default().raw())
        .await
        .unwrap();

    assert_eq!(
        handle.snapshot(),
        Some(ResultSnapshot::Raw(Snapshot::Document(alice)))
    );
}

#[tokio::test]
async fn test_empty_collection_reads_as_empty_sequence() {
    let (_store, _cache, engine) = setup();

    let handle = engine
        .read(
            query_key!["empty"],
            QueryRef::collection("empty"),
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(handle.status(), QueryStatus::Success);
    assert_eq!(handle.snapshot(), Some(ResultSnapshot::Extracted(Vec::new())));
}

#[tokio::test]
async fn test_refetch_replaces_result() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::collection("products");
    store.set_snapshot(&reference, named_docs(&["a"]));

    let handle = engine
        .read(
            query_key!["products"],
            reference.clone(),
            QueryOptions::default().with_id_field("id"),
        )
        .await
        .unwrap();

    store.set_snapshot(&reference, named_docs(&["b", "c"]));
    handle.refetch().await;

    assert_eq!(extracted_ids(&handle.snapshot().unwrap()), vec!["b", "c"]);
    assert_eq!(handle.state().data_update_count, 2);
}

// --- Live Reads ---

#[tokio::test]
async fn test_live_read_replaces_on_every_snapshot() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::collection("todos");

    let handle = engine
        .live_read(
            query_key!["todos"],
            reference.clone(),
            QueryOptions::live().with_id_field("id"),
        )
        .await
        .unwrap();

    assert_eq!(handle.listener_state(), Some(ListenerState::Attaching));
    assert_eq!(handle.status(), QueryStatus::Loading);

    store.emit(&reference, named_docs(&["write"]));
    assert_eq!(handle.listener_state(), Some(ListenerState::Active));
    assert_eq!(extracted_ids(&handle.snapshot().unwrap()), vec!["write"]);

    store.emit(&reference, named_docs(&["write", "test"]));
    assert_eq!(
        extracted_ids(&handle.snapshot().unwrap()),
        vec!["write", "test"]
    );
    assert_eq!(handle.state().data_update_count, 2);
    assert_eq!(store.read_count(), 0);
}

#[tokio::test]
async fn test_consumers_share_one_listener() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::collection("todos");
    let key = query_key!["todos"];

    let first = engine
        .live_read(key.clone(), reference.clone(), QueryOptions::live())
        .await
        .unwrap();
    let second = engine
        .live_read(key.clone(), reference.clone(), QueryOptions::live())
        .await
        .unwrap();

    assert_eq!(store.attach_count(), 1);
    assert_eq!(engine.consumer_count(&key), 2);

    store.emit(&reference, named_docs(&["a"]));
    assert_eq!(first.snapshot(), second.snapshot());

    drop(first);
    assert_eq!(store.listeners_on(&reference), 1);

    drop(second);
    assert_eq!(store.listeners_on(&reference), 0);
    assert_eq!(store.detach_count(), 1);
}

#[tokio::test]
async fn test_refetch_on_active_listener_is_noop() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::collection("todos");

    let handle = engine
        .live_read(query_key!["todos"], reference.clone(), QueryOptions::live())
        .await
        .unwrap();
    store.emit(&reference, named_docs(&["a"]));

    handle.refetch().await;
    handle.refetch().await;

    assert_eq!(store.attach_count(), 1);
    assert!(!handle.state().is_fetching);
}

#[tokio::test]
async fn test_metadata_flag_is_passed_verbatim() {
    let (store, _cache, engine) = setup();
    let with_metadata = QueryRef::collection("a");
    let without = QueryRef::collection("b");

    let _a = engine
        .live_read(
            query_key!["a"],
            with_metadata.clone(),
            QueryOptions::live().with_metadata_changes(),
        )
        .await
        .unwrap();
    let _b = engine
        .live_read(query_key!["b"], without.clone(), QueryOptions::live())
        .await
        .unwrap();

    assert!(store.listen_options_on(&with_metadata)[0].include_metadata_changes);
    assert!(!store.listen_options_on(&without)[0].include_metadata_changes);
}

#[tokio::test]
async fn test_dropping_last_handle_tears_everything_down() {
    let (store, cache, engine) = setup();
    let reference = QueryRef::collection("todos");
    let key = query_key!["todos"];

    let handle = engine
        .live_read(key.clone(), reference.clone(), QueryOptions::live())
        .await
        .unwrap();
    store.emit(&reference, named_docs(&["a"]));
    assert!(cache.get(&key).is_some());

    drop(handle);

    assert_eq!(store.active_listeners(), 0);
    assert!(engine.listener_state(&key).is_none());
    assert_eq!(engine.observed_key_count(), 0);
    assert!(cache.get(&key).is_none());

    // Late events from the torn-down listener go nowhere.
    store.emit(&reference, named_docs(&["b"]));
    assert!(cache.get(&key).is_none());
}

#[tokio::test]
async fn test_rebind_releases_old_key_first() {
    let (store, _cache, engine) = setup();
    let user_a = QueryRef::document("users/a");
    let user_b = QueryRef::document("users/b");

    let mut handle = engine
        .live_read(query_key!["users", "a"], user_a.clone(), QueryOptions::live())
        .await
        .unwrap();
    assert_eq!(store.listeners_on(&user_a), 1);

    handle.rebind(query_key!["users", "b"], user_b.clone());
    assert_eq!(store.listeners_on(&user_a), 0);
    assert_eq!(store.detach_count(), 1);
    assert_eq!(engine.consumer_count(&query_key!["users", "a"]), 0);

    handle.refetch().await;
    assert_eq!(store.listeners_on(&user_b), 1);
    assert_eq!(handle.key(), &query_key!["users", "b"]);

    store.emit(&user_b, Snapshot::Document(doc("b", json!({"name": "Bea"}))));
    assert_eq!(handle.snapshot().unwrap().records().unwrap()[0]["name"], "Bea");
}

#[tokio::test]
async fn test_watch_observes_state_changes() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::collection("todos");

    let handle = engine
        .live_read(query_key!["todos"], reference.clone(), QueryOptions::live())
        .await
        .unwrap();
    let fetching = handle.watch().try_recv().unwrap();
    assert!(fetching.is_fetching);

    store.emit(&reference, named_docs(&["a"]));
    let latest = handle.watch().latest().unwrap();
    assert_eq!(latest.status, QueryStatus::Success);
}

#[tokio::test]
async fn test_selector_applies_on_top_of_canonical_result() {
    let (store, cache, engine) = setup();
    let reference = QueryRef::collection("todos");
    let key = query_key!["todos", "count"];

    let handle = engine
        .query(key.clone(), reference.clone(), QueryOptions::default())
        .unwrap();
    // Keep only the first record, the way a single-document view would.
    cache.set_selector(&key, |value| match value {
        livequery::CacheValue::Single(ResultSnapshot::Extracted(mut records)) => {
            records.truncate(1);
            livequery::CacheValue::Single(ResultSnapshot::Extracted(records))
        }
        other => other,
    });
    store.set_snapshot(&reference, named_docs(&["a", "b", "c"]));
    handle.refetch().await;

    assert_eq!(handle.snapshot().unwrap().len(), 1);
}

// --- Named Queries ---

#[tokio::test]
async fn test_named_reference_resolves_once() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::query("products", json!({"featured": true}));
    store.define_named("featured-products", reference.clone());
    store.set_snapshot(&reference, named_docs(&["hat"]));

    let handle = engine
        .read(
            query_key!["featured"],
            Reference::named("featured-products"),
            QueryOptions::default().with_id_field("id"),
        )
        .await
        .unwrap();
    handle.refetch().await;

    assert_eq!(extracted_ids(&handle.snapshot().unwrap()), vec!["hat"]);
    assert_eq!(store.named_lookups(), 1);
    assert_eq!(store.read_count(), 2);
    assert_eq!(engine.resolve("featured-products").await.unwrap(), reference);
    assert_eq!(store.named_lookups(), 1);
}

#[tokio::test]
async fn test_named_reference_for_live_read() {
    let (store, _cache, engine) = setup();
    let reference = QueryRef::collection("orders");
    store.define_named("open-orders", reference.clone());

    let handle = engine
        .live_read(
            query_key!["orders", "open"],
            Reference::named("open-orders"),
            QueryOptions::live(),
        )
        .await
        .unwrap();

    assert_eq!(store.listeners_on(&reference), 1);
    store.emit(&reference, named_docs(&["o1"]));
    assert_eq!(handle.status(), QueryStatus::Success);
}

// --- Pagination ---

#[tokio::test]
async fn test_paginated_read_stops_at_terminal_page() {
    let (store, _cache, engine) = setup();
    store.set_snapshot(&page_ref(None), named_docs(&["a", "b"]));
    store.set_snapshot(&page_ref(Some("b")), named_docs(&["c"]));

    let handle = engine
        .read_pages(
            query_key!["products", "paged"],
            page_ref(None),
            QueryOptions::default().with_id_field("id"),
            next_page,
        )
        .await
        .unwrap();

    assert_eq!(handle.page_count(), 1);
    assert!(handle.has_next_page());

    handle.fetch_next_page().await;
    assert_eq!(handle.page_count(), 2);
    assert!(!handle.has_next_page());
    assert_eq!(handle.page_reference(1), Some(page_ref(Some("b"))));

    let reads = store.read_count();
    handle.fetch_next_page().await;
    handle.fetch_next_page().await;

    assert_eq!(store.read_count(), reads);
    assert_eq!(handle.page_count(), 2);

    let data = handle.data().unwrap();
    assert_eq!(data.pages.len(), 2);
    assert_eq!(ids(data.records(), "id"), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_live_pages_freeze_cursors() {
    let (store, _cache, engine) = setup();

    let handle = engine
        .live_read_pages(
            query_key!["products", "live"],
            page_ref(None),
            QueryOptions::live().with_id_field("id"),
            next_page,
        )
        .await
        .unwrap();
    assert_eq!(store.listeners_on(&page_ref(None)), 1);
    assert_eq!(handle.page_count(), 0);

    // Not loaded yet: nothing to page from.
    handle.fetch_next_page().await;
    assert_eq!(store.attach_count(), 1);

    store.emit(&page_ref(None), named_docs(&["a", "b"]));
    handle.fetch_next_page().await;
    assert_eq!(store.listeners_on(&page_ref(Some("b"))), 1);

    store.emit(&page_ref(Some("b")), named_docs(&["c", "d"]));
    assert_eq!(handle.page_count(), 2);

    // Page 0 changes after page 1 exists.
    store.emit(&page_ref(None), named_docs(&["a", "z"]));

    assert_eq!(handle.page_reference(1), Some(page_ref(Some("b"))));
    assert_eq!(store.listeners_on(&page_ref(Some("z"))), 0);
    let data = handle.data().unwrap();
    assert_eq!(ids(data.records(), "id"), vec!["a", "z", "c", "d"]);

    // The tail still derives its own cursor.
    handle.fetch_next_page().await;
    assert_eq!(store.listeners_on(&page_ref(Some("d"))), 1);
    assert_eq!(store.active_listeners(), 3);

    drop(handle);
    assert_eq!(store.active_listeners(), 0);
    assert_eq!(engine.observed_key_count(), 0);
}

#[tokio::test]
async fn test_refetch_restarts_from_first_page() {
    let (store, _cache, engine) = setup();
    store.set_snapshot(&page_ref(None), named_docs(&["a", "b"]));
    store.set_snapshot(&page_ref(Some("b")), named_docs(&["c", "d"]));

    let handle = engine
        .read_pages(
            query_key!["products", "paged"],
            page_ref(None),
            QueryOptions::default().with_id_field("id"),
            next_page,
        )
        .await
        .unwrap();
    handle.fetch_next_page().await;
    assert_eq!(handle.page_count(), 2);

    handle.refetch().await;

    assert_eq!(handle.page_count(), 1);
    assert_eq!(ids(handle.data().unwrap().records(), "id"), vec!["a", "b"]);
    assert_eq!(engine.observed_key_count(), 1);
}

#[tokio::test]
async fn test_max_pages_caps_sequence() {
    common::init_tracing();
    let store = MockStore::new("default");
    let cache = Arc::new(MemoryCache::new());
    let engine = SyncEngine::with_config(
        store.clone(),
        cache,
        EngineConfig {
            max_pages: Some(2),
            ..Default::default()
        },
    );
    store.set_snapshot(&page_ref(None), named_docs(&["a", "b"]));
    store.set_snapshot(&page_ref(Some("b")), named_docs(&["c", "d"]));
    store.set_snapshot(&page_ref(Some("d")), named_docs(&["e", "f"]));

    let handle = engine
        .read_pages(
            query_key!["products"],
            page_ref(None),
            QueryOptions::default().with_id_field("id"),
            next_page,
        )
        .await
        .unwrap();
    handle.fetch_next_page().await;
    handle.fetch_next_page().await;

    assert_eq!(handle.page_count(), 2);
    assert!(!handle.has_next_page());
    assert_eq!(store.read_count(), 2);
}

#[tokio::test]
async fn test_raw_pages_aggregate_in_order() {
    let (store, _cache, engine) = setup();
    let first = query(vec![doc("a", json!({"n": 1})), doc("b", json!({"n": 2}))]);
    store.set_snapshot(&page_ref(None), first.clone());

    let handle = engine
        .read_pages(
            query_key!["raw"],
            page_ref(None),
            QueryOptions::default().raw(),
            |_snapshot: &ResultSnapshot| None,
        )
        .await
        .unwrap();

    let data = handle.data().unwrap();
    assert_eq!(data.pages, vec![ResultSnapshot::Raw(first)]);
    assert_eq!(data.len(), 2);
    assert!(data.records().is_empty());
    assert!(!handle.has_next_page());
}
