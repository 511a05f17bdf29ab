//! In-process cache binding.

use crate::key::QueryKey;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use super::types::{CacheBinding, CacheState, CacheUpdate, CacheValue, CacheWatch};

/// Post-read transform applied to a key's data.
pub type Selector = Arc<dyn Fn(CacheValue) -> CacheValue + Send + Sync>;

/// Configuration for [`MemoryCache`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Max buffered states per watcher before it stops receiving.
    /// Default: 64
    pub buffer_size: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self { buffer_size: 64 }
    }
}

#[derive(Default)]
struct Slot {
    state: CacheState,
    observers: usize,
    /// Live channels by watch id. Overflowed watchers are removed here
    /// but still count as observers until their watch is dropped.
    senders: HashMap<u64, Sender<CacheState>>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<QueryKey, Slot>,
    selectors: HashMap<QueryKey, Selector>,
    next_watch_id: u64,
}

/// Apply `select` to a state taken out of the lock.
fn selected(mut state: CacheState, select: Option<Selector>) -> CacheState {
    if let Some(select) = select {
        state.data = state.data.map(|data| select(data));
    }
    state
}

/// Identity-keyed cache held in memory.
///
/// A key's slot exists only while at least one [`CacheWatch`] observes
/// it; writes to unobserved keys are ignored.
///
/// Selectors run with no cache lock held and may call back into the
/// cache.
pub struct MemoryCache {
    inner: Arc<Mutex<Inner>>,
    /// Serializes writes so watchers see them in order.
    publish: ReentrantMutex<()>,
    config: MemoryCacheConfig,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    pub fn with_config(config: MemoryCacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            publish: ReentrantMutex::new(()),
            config,
        }
    }

    /// Install a selection transform for `key`. Applies to `get` and to
    /// watcher notifications; the stored value stays canonical.
    pub fn set_selector(
        &self,
        key: &QueryKey,
        select: impl Fn(CacheValue) -> CacheValue + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .selectors
            .insert(key.clone(), Arc::new(select));
    }

    pub fn clear_selector(&self, key: &QueryKey) {
        self.inner.lock().selectors.remove(key);
    }

    /// Number of live (observed) keys.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of watches currently held for `key`.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.inner
            .lock()
            .slots
            .get(key)
            .map_or(0, |slot| slot.observers)
    }

    fn release(inner: &Weak<Mutex<Inner>>, key: &QueryKey, watch_id: u64) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock();
        let Some(slot) = inner.slots.get_mut(key) else {
            return;
        };

        slot.senders.remove(&watch_id);
        slot.observers = slot.observers.saturating_sub(1);
        if slot.observers == 0 {
            inner.slots.remove(key);
            trace!(key = %key, "disposed unobserved cache entry");
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBinding for MemoryCache {
    fn get(&self, key: &QueryKey) -> Option<CacheState> {
        let (state, select) = {
            let inner = self.inner.lock();
            let slot = inner.slots.get(key)?;
            (slot.state.clone(), inner.selectors.get(key).cloned())
        };
        Some(selected(state, select))
    }

    fn set(&self, key: &QueryKey, update: CacheUpdate) {
        let _publish = self.publish.lock();

        let (state, select, senders) = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.slots.get_mut(key) else {
                trace!(key = %key, "ignoring write to unobserved key");
                return;
            };
            slot.state.apply(update);
            let state = slot.state.clone();
            let senders: Vec<(u64, Sender<CacheState>)> = slot
                .senders
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect();
            (state, inner.selectors.get(key).cloned(), senders)
        };

        let notification = selected(state, select);
        let mut overflowed = Vec::new();
        for (id, sender) in &senders {
            match sender.try_send(notification.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    overflowed.push(*id);
                }
            }
        }
        if overflowed.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(key) {
            for id in overflowed {
                slot.senders.remove(&id);
                debug!(key = %key, watch = id, "dropped slow cache watcher");
            }
        }
    }

    fn subscribe(&self, key: &QueryKey) -> CacheWatch {
        let (sender, receiver) = bounded(self.config.buffer_size);

        let watch_id = {
            let mut inner = self.inner.lock();
            inner.next_watch_id += 1;
            let watch_id = inner.next_watch_id;
            let slot = inner.slots.entry(key.clone()).or_default();
            slot.observers += 1;
            slot.senders.insert(watch_id, sender);
            watch_id
        };

        let inner = Arc::downgrade(&self.inner);
        let key = key.clone();
        CacheWatch::new(receiver, move || Self::release(&inner, &key, watch_id))
    }
}
