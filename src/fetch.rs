//! One-shot reads.

use crate::error::{Result, SyncError};
use crate::key::QueryKey;
use crate::normalize::{normalize, NormalizeMode};
use crate::remote::RemoteStore;
use crate::subscriptions::{Generation, SnapshotSink, SubscriptionManager};
use crate::types::{QueryRef, ResultSnapshot, Source};
use std::sync::Arc;
use tracing::{debug, trace};

/// How a tagged fetch ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Commit {
    /// The result (or error) was written.
    Written,
    /// The key was torn down or refetched while the read was in flight.
    StaleWriteSuppressed,
}

/// Performs single reads against the remote store.
#[derive(Clone)]
pub struct FetchExecutor {
    store: Arc<dyn RemoteStore>,
}

impl FetchExecutor {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Read `reference` once and normalize the result. Not retried.
    pub async fn fetch_once(
        &self,
        reference: &QueryRef,
        source: Source,
        mode: &NormalizeMode,
    ) -> Result<ResultSnapshot> {
        let snapshot = self
            .store
            .get(reference, source)
            .await
            .map_err(SyncError::RemoteRead)?;
        Ok(normalize(snapshot, mode))
    }

    /// Read once on behalf of `key`, writing to `sink` only if
    /// `generation` is still current for the key when the read settles.
    /// A listener attached in the meantime supersedes the read.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn execute(
        &self,
        manager: &SubscriptionManager,
        key: &QueryKey,
        generation: Generation,
        reference: &QueryRef,
        source: Source,
        mode: &NormalizeMode,
        sink: &dyn SnapshotSink,
    ) -> Commit {
        debug!(key = %key, ?source, "fetching");
        let result = self.fetch_once(reference, source, mode).await;

        let written = manager.commit_fetch(key, generation, || match result {
            Ok(snapshot) => sink.deliver(snapshot),
            Err(error) => {
                debug!(key = %key, error = %error, "fetch failed");
                sink.fail(error);
            }
        });

        if written {
            Commit::Written
        } else {
            trace!(key = %key, "stale write suppressed (fetch)");
            Commit::StaleWriteSuppressed
        }
    }
}
