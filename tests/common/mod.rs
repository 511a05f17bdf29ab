//! Scripted remote store shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use livequery::{
    DocumentSnapshot, ListenOptions, ListenerRegistration, QueryRef, QuerySnapshot, RemoteError,
    RemoteStore, Snapshot, SnapshotCallback, SnapshotMetadata, Source, StoreInstanceId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;

type ReadResult = Result<Snapshot, RemoteError>;

struct MockListener {
    fingerprint: String,
    options: ListenOptions,
    callback: SnapshotCallback,
}

#[derive(Default)]
struct MockState {
    snapshots: HashMap<String, Snapshot>,
    read_failures: HashMap<String, RemoteError>,
    held_reads: HashMap<String, VecDeque<oneshot::Receiver<ReadResult>>>,
    listeners: HashMap<u64, MockListener>,
    next_listener_id: u64,
    named: HashMap<String, QueryRef>,
    read_count: usize,
    attach_count: usize,
    detach_count: usize,
    named_lookups: usize,
    last_source: Option<Source>,
}

/// Identity of a reference inside the mock.
pub fn fingerprint(reference: &QueryRef) -> String {
    format!("{:?}:{}:{}", reference.kind, reference.path, reference.params)
}

pub struct MockStore {
    id: String,
    state: Arc<Mutex<MockState>>,
}

impl MockStore {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Arc::new(Mutex::new(MockState::default())),
        })
    }

    // --- Scripting ---

    pub fn set_snapshot(&self, reference: &QueryRef, snapshot: Snapshot) {
        self.state
            .lock()
            .snapshots
            .insert(fingerprint(reference), snapshot);
    }

    pub fn fail_reads(&self, reference: &QueryRef, error: RemoteError) {
        self.state
            .lock()
            .read_failures
            .insert(fingerprint(reference), error);
    }

    pub fn clear_read_failure(&self, reference: &QueryRef) {
        self.state.lock().read_failures.remove(&fingerprint(reference));
    }

    /// The next read of `reference` blocks until the sender resolves it.
    pub fn hold_next_read(&self, reference: &QueryRef) -> oneshot::Sender<ReadResult> {
        let (sender, receiver) = oneshot::channel();
        self.state
            .lock()
            .held_reads
            .entry(fingerprint(reference))
            .or_default()
            .push_back(receiver);
        sender
    }

    pub fn define_named(&self, name: &str, reference: QueryRef) {
        self.state.lock().named.insert(name.to_string(), reference);
    }

    /// Deliver a snapshot to every listener on `reference`.
    pub fn emit(&self, reference: &QueryRef, snapshot: Snapshot) {
        for callback in self.callbacks_for(reference) {
            callback(Ok(snapshot.clone()));
        }
    }

    pub fn emit_error(&self, reference: &QueryRef, error: RemoteError) {
        for callback in self.callbacks_for(reference) {
            callback(Err(error.clone()));
        }
    }

    fn callbacks_for(&self, reference: &QueryRef) -> Vec<SnapshotCallback> {
        let fingerprint = fingerprint(reference);
        self.state
            .lock()
            .listeners
            .values()
            .filter(|listener| listener.fingerprint == fingerprint)
            .map(|listener| Arc::clone(&listener.callback))
            .collect()
    }

    // --- Inspection ---

    pub fn read_count(&self) -> usize {
        self.state.lock().read_count
    }

    pub fn attach_count(&self) -> usize {
        self.state.lock().attach_count
    }

    pub fn detach_count(&self) -> usize {
        self.state.lock().detach_count
    }

    pub fn active_listeners(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn listeners_on(&self, reference: &QueryRef) -> usize {
        self.callbacks_for(reference).len()
    }

    pub fn listen_options_on(&self, reference: &QueryRef) -> Vec<ListenOptions> {
        let fingerprint = fingerprint(reference);
        self.state
            .lock()
            .listeners
            .values()
            .filter(|listener| listener.fingerprint == fingerprint)
            .map(|listener| listener.options)
            .collect()
    }

    pub fn named_lookups(&self) -> usize {
        self.state.lock().named_lookups
    }

    pub fn last_source(&self) -> Option<Source> {
        self.state.lock().last_source
    }
}

#[async_trait]
impl RemoteStore for MockStore {
    fn instance_id(&self) -> StoreInstanceId {
        StoreInstanceId(self.id.clone())
    }

    async fn get(&self, reference: &QueryRef, source: Source) -> Result<Snapshot, RemoteError> {
        let fingerprint = fingerprint(reference);
        let held = {
            let mut state = self.state.lock();
            state.read_count += 1;
            state.last_source = Some(source);
            state
                .held_reads
                .get_mut(&fingerprint)
                .and_then(VecDeque::pop_front)
        };

        if let Some(receiver) = held {
            return receiver
                .await
                .unwrap_or_else(|_| Err(RemoteError::new("cancelled", "held read dropped")));
        }

        let state = self.state.lock();
        if let Some(error) = state.read_failures.get(&fingerprint) {
            return Err(error.clone());
        }
        Ok(state
            .snapshots
            .get(&fingerprint)
            .cloned()
            .unwrap_or_else(|| query(Vec::new())))
    }

    fn listen(
        &self,
        reference: &QueryRef,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> ListenerRegistration {
        let id = {
            let mut state = self.state.lock();
            state.attach_count += 1;
            state.next_listener_id += 1;
            let id = state.next_listener_id;
            state.listeners.insert(
                id,
                MockListener {
                    fingerprint: fingerprint(reference),
                    options,
                    callback,
                },
            );
            id
        };

        let state = Arc::clone(&self.state);
        ListenerRegistration::new(move || {
            let mut state = state.lock();
            if state.listeners.remove(&id).is_some() {
                state.detach_count += 1;
            }
        })
    }

    async fn named_query(&self, name: &str) -> Result<Option<QueryRef>, RemoteError> {
        self.state.lock().named_lookups += 1;
        // Give concurrent callers a chance to pile up.
        tokio::task::yield_now().await;
        Ok(self.state.lock().named.get(name).cloned())
    }
}

// --- Snapshot builders ---

pub fn doc(id: &str, data: Value) -> DocumentSnapshot {
    DocumentSnapshot {
        id: id.to_string(),
        path: format!("items/{}", id),
        data: data.as_object().cloned(),
        metadata: SnapshotMetadata::default(),
    }
}

pub fn query(documents: Vec<DocumentSnapshot>) -> Snapshot {
    Snapshot::Query(QuerySnapshot {
        documents,
        metadata: SnapshotMetadata::default(),
    })
}

/// Query snapshot of `{"name": id}` documents.
pub fn named_docs(ids: &[&str]) -> Snapshot {
    query(
        ids.iter()
            .map(|id| doc(id, serde_json::json!({ "name": id })))
            .collect(),
    )
}

/// Ids of the extracted records in a result, read from `field`.
pub fn ids<'a>(
    records: impl IntoIterator<Item = &'a livequery::DocumentData>,
    field: &str,
) -> Vec<String> {
    records
        .into_iter()
        .filter_map(|record| record.get(field).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}
