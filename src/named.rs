//! Named query resolution.
//!
//! Lookups are keyed per `(store instance, name)`. An in-flight lookup is
//! a shared future that concurrent first callers join; it is held apart
//! from the bounded cache so capacity never splits it. Successful
//! resolutions move into the LRU. Failures are dropped once they settle,
//! so a later call (e.g. after the bundle is loaded) looks the name up
//! again.

use crate::error::{Result, SyncError};
use crate::remote::RemoteStore;
use crate::types::{QueryRef, StoreInstanceId};
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default number of cached resolutions.
pub const DEFAULT_NAMED_QUERY_CAPACITY: usize = 256;

type Lookup = Shared<BoxFuture<'static, Result<QueryRef>>>;

#[derive(Clone, PartialEq, Eq, Hash)]
struct NamedQueryKey {
    instance: StoreInstanceId,
    name: String,
}

struct Pending {
    /// Distinguishes this lookup from a later one for the same key.
    token: u64,
    lookup: Lookup,
}

struct Resolutions {
    resolved: LruCache<NamedQueryKey, QueryRef>,
    pending: HashMap<NamedQueryKey, Pending>,
}

/// Caches named query lookups.
pub struct NamedQueryResolver {
    resolutions: Mutex<Resolutions>,
    next_token: AtomicU64,
}

impl NamedQueryResolver {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NAMED_QUERY_CAPACITY)
    }

    /// Resolver keeping at most `capacity` settled resolutions (minimum 1).
    /// In-flight lookups do not count against it.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolutions: Mutex::new(Resolutions {
                resolved: LruCache::new(capacity),
                pending: HashMap::new(),
            }),
            next_token: AtomicU64::new(1),
        }
    }

    /// Resolve `name` against `store`.
    pub async fn resolve(&self, store: &Arc<dyn RemoteStore>, name: &str) -> Result<QueryRef> {
        let key = NamedQueryKey {
            instance: store.instance_id(),
            name: name.to_string(),
        };

        let (token, lookup) = {
            let mut resolutions = self.resolutions.lock();
            if let Some(reference) = resolutions.resolved.get(&key) {
                return Ok(reference.clone());
            }
            match resolutions.pending.get(&key) {
                Some(pending) => (pending.token, pending.lookup.clone()),
                None => {
                    let token = self.next_token.fetch_add(1, Ordering::SeqCst);
                    let lookup = Self::lookup(Arc::clone(store), key.name.clone());
                    resolutions.pending.insert(
                        key.clone(),
                        Pending {
                            token,
                            lookup: lookup.clone(),
                        },
                    );
                    (token, lookup)
                }
            }
        };

        let result = lookup.await;

        // The first caller to see the lookup settle moves it out of
        // `pending`; a forgotten or replaced lookup is left alone.
        let mut resolutions = self.resolutions.lock();
        if resolutions.pending.get(&key).map(|p| p.token) == Some(token) {
            resolutions.pending.remove(&key);
            if let Ok(reference) = &result {
                resolutions.resolved.put(key, reference.clone());
            }
        }

        result
    }

    fn lookup(store: Arc<dyn RemoteStore>, name: String) -> Lookup {
        async move {
            debug!(instance = %store.instance_id(), name = %name, "looking up named query");
            match store.named_query(&name).await {
                Ok(Some(reference)) => Ok(reference),
                Ok(None) => Err(SyncError::NamedQueryNotFound(name)),
                Err(error) => Err(SyncError::RemoteRead(error)),
            }
        }
        .boxed()
        .shared()
    }

    /// Drop the cached resolution for `name`, if any.
    pub fn forget(&self, store: &dyn RemoteStore, name: &str) {
        let key = NamedQueryKey {
            instance: store.instance_id(),
            name: name.to_string(),
        };
        let mut resolutions = self.resolutions.lock();
        resolutions.resolved.pop(&key);
        resolutions.pending.remove(&key);
    }

    /// Number of cached (or in-flight) resolutions.
    pub fn len(&self) -> usize {
        let resolutions = self.resolutions.lock();
        resolutions.resolved.len() + resolutions.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NamedQueryResolver {
    fn default() -> Self {
        Self::new()
    }
}
