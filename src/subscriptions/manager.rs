//! Subscription manager: one listener per live key.
//!
//! Every mutation of an entry goes through the entry map lock. Store
//! registration and detach functions run after that lock is released.
//!
//! Store callbacks may arrive on any thread. Each check-and-write runs
//! inside the manager's delivery turn, as does the teardown of an entry,
//! so writes for a key are totally ordered and none lands after its
//! entry is gone. The turn is reentrant: a sink may drop guards or query
//! the manager from the delivering thread.

use crate::error::SyncError;
use crate::key::QueryKey;
use crate::normalize::{normalize, NormalizeMode};
use crate::remote::{ListenOptions, ListenerRegistration, RemoteStore, SnapshotCallback};
use crate::types::QueryRef;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::types::{Generation, ListenerState, SnapshotSink};

/// Internal per-key state.
struct Entry {
    /// Live consumers holding a guard for this key.
    consumers: usize,
    /// Token of the latest attach.
    listener: Generation,
    /// Token of the latest one-shot read.
    fetch: Generation,
    state: ListenerState,
    registration: Option<ListenerRegistration>,
}

/// Result of an attach request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AttachOutcome {
    /// A new listener was registered.
    Attached,
    /// A listener is already registered for the key.
    AlreadyAttached,
    /// The key was torn down or failed while the store registered the
    /// listener; the registration was released.
    Superseded,
    /// No consumer holds the key.
    NotObserved,
}

/// Owns the key → entry map.
pub(crate) struct SubscriptionManager {
    entries: Mutex<HashMap<QueryKey, Entry>>,
    next_generation: AtomicU64,
    /// Held across every check-and-write and every entry teardown.
    delivery: ReentrantMutex<()>,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            delivery: ReentrantMutex::new(()),
        }
    }

    fn next_generation(&self) -> Generation {
        Generation(self.next_generation.fetch_add(1, Ordering::SeqCst))
    }

    // --- Consumers ---

    /// Register a consumer for `key`. The consumer is released when the
    /// guard drops.
    pub(crate) fn acquire(self: &Arc<Self>, key: &QueryKey) -> ConsumerGuard {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => entry.consumers += 1,
            None => {
                let generation = self.next_generation();
                entries.insert(
                    key.clone(),
                    Entry {
                        consumers: 1,
                        listener: generation,
                        fetch: generation,
                        state: ListenerState::Idle,
                        registration: None,
                    },
                );
            }
        }

        ConsumerGuard {
            manager: Arc::clone(self),
            key: key.clone(),
        }
    }

    /// Drop one consumer. The last one tears the entry down and detaches
    /// its listener before returning.
    fn release(&self, key: &QueryKey) {
        let registration = {
            let _turn = self.delivery.lock();
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.consumers = entry.consumers.saturating_sub(1);
            if entry.consumers > 0 {
                return;
            }
            entries.remove(key).and_then(|entry| entry.registration)
        };

        if let Some(registration) = registration {
            debug!(key = %key, "detaching listener");
            registration.detach();
        }
        trace!(key = %key, "entry torn down");
    }

    // --- Live listeners ---

    /// Whether `key` is observed and has no registered listener.
    pub(crate) fn needs_attach(&self, key: &QueryKey) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| !entry.state.is_attached())
    }

    /// Open a listener for `key` unless one is already registered.
    pub(crate) fn attach(
        self: &Arc<Self>,
        key: &QueryKey,
        store: &dyn RemoteStore,
        reference: &QueryRef,
        options: ListenOptions,
        mode: NormalizeMode,
        sink: Arc<dyn SnapshotSink>,
    ) -> AttachOutcome {
        let generation = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return AttachOutcome::NotObserved;
            };
            if entry.state.is_attached() {
                return AttachOutcome::AlreadyAttached;
            }
            let generation = self.next_generation();
            entry.listener = generation;
            entry.state = ListenerState::Attaching;
            generation
        };

        debug!(key = %key, generation = generation.0, "attaching listener");
        let callback = self.listener_callback(key.clone(), generation, mode, sink);
        let registration = store.listen(reference, options, callback);

        let superseded = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.listener == generation && entry.state.is_attached() => {
                    entry.registration = Some(registration);
                    None
                }
                _ => Some(registration),
            }
        };

        match superseded {
            None => AttachOutcome::Attached,
            Some(registration) => {
                debug!(key = %key, "listener superseded during attach");
                registration.detach();
                AttachOutcome::Superseded
            }
        }
    }

    fn listener_callback(
        self: &Arc<Self>,
        key: QueryKey,
        generation: Generation,
        mode: NormalizeMode,
        sink: Arc<dyn SnapshotSink>,
    ) -> SnapshotCallback {
        let manager = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match event {
                Ok(snapshot) => {
                    let _turn = manager.delivery.lock();
                    if manager.mark_active(&key, generation) {
                        sink.deliver(normalize(snapshot, &mode));
                    } else {
                        trace!(key = %key, "stale write suppressed (listener)");
                    }
                }
                Err(error) => {
                    let error = SyncError::Listener(error);
                    let registration = {
                        let _turn = manager.delivery.lock();
                        let Some(registration) = manager.mark_errored(&key, generation, &error)
                        else {
                            trace!(key = %key, "stale listener error suppressed");
                            return;
                        };
                        warn!(key = %key, error = %error, "listener failed");
                        sink.fail(error);
                        registration
                    };
                    // Detached after the turn is released.
                    drop(registration);
                }
            }
        })
    }

    /// Attaching → Active. False if the callback belongs to a listener
    /// that is no longer current.
    fn mark_active(&self, key: &QueryKey, generation: Generation) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.listener == generation && entry.state.is_attached() => {
                entry.state = ListenerState::Active;
                true
            }
            _ => false,
        }
    }

    /// Attaching|Active → Errored, handing back the registration to
    /// release. `None` if the listener is no longer current; `Some(None)`
    /// if the store failed before registration returned.
    fn mark_errored(
        &self,
        key: &QueryKey,
        generation: Generation,
        error: &SyncError,
    ) -> Option<Option<ListenerRegistration>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.listener == generation && entry.state.is_attached() => {
                entry.state = ListenerState::Errored(error.clone());
                Some(entry.registration.take())
            }
            _ => None,
        }
    }

    // --- One-shot reads ---

    /// Start a tagged one-shot operation. `None` if `key` is not observed,
    /// or if a listener is registered and already keeps it current.
    pub(crate) fn begin_fetch(&self, key: &QueryKey) -> Option<Generation> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.state.is_attached() {
            trace!(key = %key, "read skipped, listener attached");
            return None;
        }
        let generation = self.next_generation();
        entry.fetch = generation;
        Some(generation)
    }

    /// Whether the one-shot operation tagged `generation` may still write.
    /// A listener attached since the read began supersedes it.
    pub(crate) fn is_current(&self, key: &QueryKey, generation: Generation) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.fetch == generation && !entry.state.is_attached())
    }

    /// Run `write` if `generation` is still current, inside the delivery
    /// turn. Returns whether it ran.
    pub(crate) fn commit_fetch(
        &self,
        key: &QueryKey,
        generation: Generation,
        write: impl FnOnce(),
    ) -> bool {
        let _turn = self.delivery.lock();
        if !self.is_current(key, generation) {
            return false;
        }
        write();
        true
    }

    // --- Inspection ---

    pub(crate) fn listener_state(&self, key: &QueryKey) -> Option<ListenerState> {
        self.entries.lock().get(key).map(|entry| entry.state.clone())
    }

    pub(crate) fn consumer_count(&self, key: &QueryKey) -> usize {
        self.entries.lock().get(key).map_or(0, |entry| entry.consumers)
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Keys with a registered listener.
    pub(crate) fn attached_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.state.is_attached())
            .count()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer's hold on a key. Releases on drop.
pub(crate) struct ConsumerGuard {
    manager: Arc<SubscriptionManager>,
    key: QueryKey,
}

impl ConsumerGuard {
    pub(crate) fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.manager.release(&self.key);
    }
}
