//! Cache binding contract and the state it stores per key.

use crate::error::SyncError;
use crate::key::QueryKey;
use crate::types::{DocumentData, ResultSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a cached query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Idle,
    /// First read in progress, no data yet.
    Loading,
    Success,
    Error,
}

/// Ordered pages of a paginated query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PagedResult {
    pub pages: Vec<ResultSnapshot>,
}

impl PagedResult {
    /// Extracted records of every page, concatenated in page order.
    /// Raw pages contribute nothing.
    pub fn records(&self) -> Vec<&DocumentData> {
        self.pages
            .iter()
            .filter_map(ResultSnapshot::records)
            .flatten()
            .collect()
    }

    /// Total documents across pages.
    pub fn len(&self) -> usize {
        self.pages.iter().map(ResultSnapshot::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical value the engine writes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    Single(ResultSnapshot),
    Pages(PagedResult),
}

impl CacheValue {
    pub fn as_single(&self) -> Option<&ResultSnapshot> {
        match self {
            CacheValue::Single(snapshot) => Some(snapshot),
            CacheValue::Pages(_) => None,
        }
    }

    pub fn as_pages(&self) -> Option<&PagedResult> {
        match self {
            CacheValue::Pages(pages) => Some(pages),
            CacheValue::Single(_) => None,
        }
    }
}

/// A single write to the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheUpdate {
    /// A read or attach has started.
    Fetching,
    /// Full replacement of the value.
    Data(CacheValue),
    /// Failure; the previous value is kept.
    Error(SyncError),
}

/// What the cache holds for one key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheState {
    pub status: QueryStatus,
    pub data: Option<CacheValue>,
    pub error: Option<SyncError>,
    pub is_fetching: bool,
    /// Number of `Data` writes applied to this key.
    pub data_update_count: u64,
}

impl CacheState {
    /// Apply an update in place.
    pub fn apply(&mut self, update: CacheUpdate) {
        match update {
            CacheUpdate::Fetching => {
                self.is_fetching = true;
                if self.data.is_none() {
                    self.status = QueryStatus::Loading;
                }
            }
            CacheUpdate::Data(value) => {
                self.data = Some(value);
                self.error = None;
                self.status = QueryStatus::Success;
                self.is_fetching = false;
                self.data_update_count += 1;
            }
            CacheUpdate::Error(error) => {
                self.error = Some(error);
                self.status = QueryStatus::Error;
                self.is_fetching = false;
            }
        }
    }
}

/// Receives state changes for one key. Dropping it stops observing the key.
pub struct CacheWatch {
    pub receiver: crossbeam_channel::Receiver<CacheState>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CacheWatch {
    pub fn new(
        receiver: crossbeam_channel::Receiver<CacheState>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// Receive the next state (blocking).
    pub fn recv(&self) -> Result<CacheState, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a state (non-blocking).
    pub fn try_recv(&self) -> Result<CacheState, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<CacheState, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every pending state, returning the latest.
    pub fn latest(&self) -> Option<CacheState> {
        self.receiver.try_iter().last()
    }
}

impl Drop for CacheWatch {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CacheWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheWatch")
            .field("pending", &self.receiver.len())
            .finish()
    }
}

/// Identity-keyed reactive cache the engine writes into.
///
/// Implementations own staleness, retries, selection transforms and
/// disposal of unobserved keys.
pub trait CacheBinding: Send + Sync {
    /// Current state for `key`, with any selection transform applied.
    fn get(&self, key: &QueryKey) -> Option<CacheState>;

    /// Apply a write to `key`.
    fn set(&self, key: &QueryKey, update: CacheUpdate);

    /// Observe `key`. The key stays alive while any watch is held.
    fn subscribe(&self, key: &QueryKey) -> CacheWatch;
}
