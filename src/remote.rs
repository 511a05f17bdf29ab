//! Contract consumed from the remote document store.

use crate::error::RemoteError;
use crate::types::{QueryRef, Snapshot, Source, StoreInstanceId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Callback invoked by the store for every listener event.
pub type SnapshotCallback =
    Arc<dyn Fn(std::result::Result<Snapshot, RemoteError>) + Send + Sync>;

/// Options passed verbatim to the store's listener registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    pub include_metadata_changes: bool,
}

/// An open listener. Detaches when dropped.
pub struct ListenerRegistration {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Registration with nothing to release.
    pub fn noop() -> Self {
        Self { detach: None }
    }

    /// Detach now.
    pub fn detach(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// A realtime document store.
///
/// `listen` may invoke the callback synchronously before it returns, and
/// from any later point until the registration is dropped.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Identity of this store instance, used to scope named queries.
    fn instance_id(&self) -> StoreInstanceId;

    /// One-shot read.
    async fn get(
        &self,
        reference: &QueryRef,
        source: Source,
    ) -> std::result::Result<Snapshot, RemoteError>;

    /// Register a change listener.
    fn listen(
        &self,
        reference: &QueryRef,
        options: ListenOptions,
        callback: SnapshotCallback,
    ) -> ListenerRegistration;

    /// Look up a named query from the loaded bundles. `Ok(None)` if no
    /// bundle defines `name`.
    async fn named_query(&self, name: &str)
        -> std::result::Result<Option<QueryRef>, RemoteError>;
}
