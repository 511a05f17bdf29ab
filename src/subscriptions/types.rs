//! Subscription entry types.

use crate::cache::{CacheBinding, CacheUpdate, CacheValue};
use crate::error::SyncError;
use crate::key::QueryKey;
use crate::types::ResultSnapshot;
use std::fmt;
use std::sync::Arc;

/// Listener lifecycle for one key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ListenerState {
    /// No listener; the key may be read once or attached.
    #[default]
    Idle,
    /// Registered with the store, no callback yet.
    Attaching,
    /// At least one callback delivered.
    Active,
    /// The listener failed and was torn down. Attachable like `Idle`.
    Errored(SyncError),
}

impl ListenerState {
    /// Whether a listener is registered (or being registered).
    pub fn is_attached(&self) -> bool {
        matches!(self, ListenerState::Attaching | ListenerState::Active)
    }
}

/// Token identifying one attach or fetch operation.
///
/// Drawn from a manager-wide counter, so a key that is torn down and
/// recreated never sees an old token again.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Generation(pub u64);

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gen({})", self.0)
    }
}

/// Destination for normalized results of one operation.
pub(crate) trait SnapshotSink: Send + Sync {
    fn deliver(&self, snapshot: ResultSnapshot);
    fn fail(&self, error: SyncError);
}

/// Writes results straight into the cache entry for `key`.
pub(crate) struct CacheSink {
    cache: Arc<dyn CacheBinding>,
    key: QueryKey,
}

impl CacheSink {
    pub(crate) fn new(cache: Arc<dyn CacheBinding>, key: QueryKey) -> Self {
        Self { cache, key }
    }
}

impl SnapshotSink for CacheSink {
    fn deliver(&self, snapshot: ResultSnapshot) {
        self.cache
            .set(&self.key, CacheUpdate::Data(CacheValue::Single(snapshot)));
    }

    fn fail(&self, error: SyncError) {
        self.cache.set(&self.key, CacheUpdate::Error(error));
    }
}
