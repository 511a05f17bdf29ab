//! Engine tying the store, the cache and the listener bookkeeping together.

use crate::cache::{
    CacheBinding, CacheState, CacheUpdate, CacheValue, CacheWatch, PagedResult, QueryStatus,
};
use crate::error::{Result, SyncError};
use crate::fetch::{Commit, FetchExecutor};
use crate::key::QueryKey;
use crate::named::{NamedQueryResolver, DEFAULT_NAMED_QUERY_CAPACITY};
use crate::normalize::NormalizeMode;
use crate::pagination::{NextReferenceFn, PageCoordinator};
use crate::remote::{ListenOptions, RemoteStore};
use crate::subscriptions::{CacheSink, ConsumerGuard, ListenerState, SubscriptionManager};
use crate::types::{QueryOptions, QueryRef, Reference, ResultSnapshot};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max cached named-query resolutions.
    /// Default: 256
    pub named_query_capacity: usize,

    /// Max pages a paginated query may hold (None = unbounded).
    pub max_pages: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            named_query_capacity: DEFAULT_NAMED_QUERY_CAPACITY,
            max_pages: None,
        }
    }
}

/// A page sequence and the number of handles holding it.
struct SharedPages {
    coordinator: Arc<PageCoordinator>,
    handles: usize,
}

/// Shared state behind every handle.
pub(crate) struct EngineContext {
    pub(crate) store: Arc<dyn RemoteStore>,
    pub(crate) cache: Arc<dyn CacheBinding>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) fetcher: FetchExecutor,
    pub(crate) resolver: NamedQueryResolver,
    pub(crate) config: EngineConfig,
    /// One page sequence per paginated root key.
    paginated: Mutex<HashMap<QueryKey, SharedPages>>,
}

impl EngineContext {
    /// Join the page sequence for `root`, creating it on first use. Later
    /// handles share the sequence created by the first one, including its
    /// options and next-reference function.
    fn claim_pages(
        self: &Arc<Self>,
        root: QueryKey,
        reference: Reference,
        options: QueryOptions,
        next_reference: NextReferenceFn,
    ) -> Arc<PageCoordinator> {
        let mut paginated = self.paginated.lock();
        match paginated.entry(root) {
            Entry::Occupied(mut occupied) => {
                let shared = occupied.get_mut();
                shared.handles += 1;
                let handles = shared.handles;
                debug!(key = %occupied.key(), handles, "joining paginated query");
                Arc::clone(&occupied.get().coordinator)
            }
            Entry::Vacant(vacant) => {
                let coordinator = Arc::new(PageCoordinator::new(
                    Arc::clone(self),
                    vacant.key().clone(),
                    reference,
                    options,
                    next_reference,
                ));
                vacant.insert(SharedPages {
                    coordinator: Arc::clone(&coordinator),
                    handles: 1,
                });
                coordinator
            }
        }
    }

    /// Drop one handle's hold on `root`. The last one tears every page down.
    fn release_pages(&self, root: &QueryKey) {
        let mut paginated = self.paginated.lock();
        let Some(shared) = paginated.get_mut(root) else {
            return;
        };
        shared.handles = shared.handles.saturating_sub(1);
        if shared.handles > 0 {
            return;
        }
        if let Some(shared) = paginated.remove(root) {
            // Page keys are released before the root can be claimed again.
            shared.coordinator.shutdown();
        }
    }

    pub(crate) async fn resolve_reference(&self, reference: &Reference) -> Result<QueryRef> {
        match reference {
            Reference::Direct(reference) => Ok(reference.clone()),
            Reference::Named(name) => self.resolver.resolve(&self.store, name).await,
        }
    }

    /// Read or attach `key` according to `options`.
    async fn run_query(&self, key: &QueryKey, reference: &Reference, options: &QueryOptions) {
        let sink = CacheSink::new(Arc::clone(&self.cache), key.clone());
        let mode = NormalizeMode::from(options);

        if options.subscribe {
            if !self.subscriptions.needs_attach(key) {
                return;
            }
            self.cache.set(key, CacheUpdate::Fetching);

            let resolved = match self.resolve_reference(reference).await {
                Ok(resolved) => resolved,
                Err(error) => {
                    if self.subscriptions.needs_attach(key) {
                        self.cache.set(key, CacheUpdate::Error(error));
                    }
                    return;
                }
            };

            let listen = ListenOptions {
                include_metadata_changes: options.include_metadata_changes,
            };
            let outcome =
                self.subscriptions
                    .attach(key, &*self.store, &resolved, listen, mode, Arc::new(sink));
            trace!(key = %key, ?outcome, "attach finished");
        } else {
            let Some(generation) = self.subscriptions.begin_fetch(key) else {
                return;
            };
            self.cache.set(key, CacheUpdate::Fetching);

            let resolved = match self.resolve_reference(reference).await {
                Ok(resolved) => resolved,
                Err(error) => {
                    if self.subscriptions.is_current(key, generation) {
                        self.cache.set(key, CacheUpdate::Error(error));
                    }
                    return;
                }
            };

            let commit = self
                .fetcher
                .execute(
                    &self.subscriptions,
                    key,
                    generation,
                    &resolved,
                    options.source,
                    &mode,
                    &sink,
                )
                .await;
            if commit == Commit::StaleWriteSuppressed {
                debug!(key = %key, "discarded superseded read");
            }
        }
    }
}

/// Keeps query results in a reactive cache in sync with a remote store.
///
/// Four call shapes share one cache representation:
/// - [`read`](Self::read): one-shot read
/// - [`live_read`](Self::live_read): live listener
/// - [`read_pages`](Self::read_pages): paginated one-shot reads
/// - [`live_read_pages`](Self::live_read_pages): paginated listeners
#[derive(Clone)]
pub struct SyncEngine {
    context: Arc<EngineContext>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, cache: Arc<dyn CacheBinding>) -> Self {
        Self::with_config(store, cache, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn RemoteStore>,
        cache: Arc<dyn CacheBinding>,
        config: EngineConfig,
    ) -> Self {
        let context = EngineContext {
            fetcher: FetchExecutor::new(Arc::clone(&store)),
            resolver: NamedQueryResolver::with_capacity(config.named_query_capacity),
            subscriptions: Arc::new(SubscriptionManager::new()),
            store,
            cache,
            config,
            paginated: Mutex::new(HashMap::new()),
        };
        Self {
            context: Arc::new(context),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheBinding> {
        &self.context.cache
    }

    // --- Handles ---

    /// Register a consumer for `key` without starting any work. Call
    /// [`QueryHandle::refetch`] to read or attach.
    pub fn query(
        &self,
        key: QueryKey,
        reference: impl Into<Reference>,
        options: QueryOptions,
    ) -> Result<QueryHandle> {
        options.validate()?;
        let watch = self.context.cache.subscribe(&key);
        let guard = self.context.subscriptions.acquire(&key);

        Ok(QueryHandle {
            context: Arc::clone(&self.context),
            reference: reference.into(),
            options,
            guard: Some(guard),
            watch,
            key,
        })
    }

    /// Register a paginated consumer rooted at `key`. Call
    /// [`InfiniteQueryHandle::refetch`] to load page 0.
    ///
    /// Handles on the same root share one page sequence; the first handle's
    /// reference, options and next-reference function define it.
    pub fn infinite_query<F>(
        &self,
        key: QueryKey,
        reference: impl Into<Reference>,
        options: QueryOptions,
        next_reference: F,
    ) -> Result<InfiniteQueryHandle>
    where
        F: Fn(&ResultSnapshot) -> Option<QueryRef> + Send + Sync + 'static,
    {
        options.validate()?;
        let watch = self.context.cache.subscribe(&key);
        let next_reference: NextReferenceFn = Arc::new(next_reference);
        let coordinator =
            self.context
                .claim_pages(key, reference.into(), options, next_reference);

        Ok(InfiniteQueryHandle {
            context: Arc::clone(&self.context),
            coordinator,
            watch,
        })
    }

    // --- Entry points ---

    /// Read `reference` once into the cache entry for `key`.
    pub async fn read(
        &self,
        key: QueryKey,
        reference: impl Into<Reference>,
        mut options: QueryOptions,
    ) -> Result<QueryHandle> {
        options.subscribe = false;
        let handle = self.query(key, reference, options)?;
        handle.refetch().await;
        Ok(handle)
    }

    /// Keep the cache entry for `key` in sync with a live listener.
    pub async fn live_read(
        &self,
        key: QueryKey,
        reference: impl Into<Reference>,
        mut options: QueryOptions,
    ) -> Result<QueryHandle> {
        options.subscribe = true;
        let handle = self.query(key, reference, options)?;
        handle.refetch().await;
        Ok(handle)
    }

    /// Paginated one-shot reads, starting with page 0.
    pub async fn read_pages<F>(
        &self,
        key: QueryKey,
        reference: impl Into<Reference>,
        mut options: QueryOptions,
        next_reference: F,
    ) -> Result<InfiniteQueryHandle>
    where
        F: Fn(&ResultSnapshot) -> Option<QueryRef> + Send + Sync + 'static,
    {
        options.subscribe = false;
        let handle = self.infinite_query(key, reference, options, next_reference)?;
        handle.coordinator.start().await;
        Ok(handle)
    }

    /// Paginated live listeners, one per page, starting with page 0. Joins
    /// the live sequence as is if another handle already started it.
    pub async fn live_read_pages<F>(
        &self,
        key: QueryKey,
        reference: impl Into<Reference>,
        mut options: QueryOptions,
        next_reference: F,
    ) -> Result<InfiniteQueryHandle>
    where
        F: Fn(&ResultSnapshot) -> Option<QueryRef> + Send + Sync + 'static,
    {
        options.subscribe = true;
        let handle = self.infinite_query(key, reference, options, next_reference)?;
        handle.coordinator.start().await;
        Ok(handle)
    }

    // --- Named queries ---

    /// Resolve a named query against this engine's store.
    pub async fn resolve(&self, name: &str) -> Result<QueryRef> {
        self.context
            .resolver
            .resolve(&self.context.store, name)
            .await
    }

    pub fn resolver(&self) -> &NamedQueryResolver {
        &self.context.resolver
    }

    // --- Inspection ---

    pub fn listener_state(&self, key: &QueryKey) -> Option<ListenerState> {
        self.context.subscriptions.listener_state(key)
    }

    pub fn consumer_count(&self, key: &QueryKey) -> usize {
        self.context.subscriptions.consumer_count(key)
    }

    /// Keys (including page keys) currently held by a consumer.
    pub fn observed_key_count(&self) -> usize {
        self.context.subscriptions.entry_count()
    }

    /// Keys with a registered listener.
    pub fn attached_listener_count(&self) -> usize {
        self.context.subscriptions.attached_count()
    }

    /// Handles currently sharing the page sequence rooted at `key`.
    pub fn paginated_handle_count(&self, key: &QueryKey) -> usize {
        self.context
            .paginated
            .lock()
            .get(key)
            .map_or(0, |shared| shared.handles)
    }
}

/// A consumer of one query key.
///
/// Dropping the handle releases the key; the last consumer's release
/// detaches the key's listener.
pub struct QueryHandle {
    context: Arc<EngineContext>,
    key: QueryKey,
    reference: Reference,
    options: QueryOptions,
    guard: Option<ConsumerGuard>,
    watch: CacheWatch,
}

impl QueryHandle {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn state(&self) -> CacheState {
        self.context.cache.get(&self.key).unwrap_or_default()
    }

    pub fn status(&self) -> QueryStatus {
        self.state().status
    }

    pub fn data(&self) -> Option<CacheValue> {
        self.state().data
    }

    /// The current result, if this key holds a single result.
    pub fn snapshot(&self) -> Option<ResultSnapshot> {
        match self.data()? {
            CacheValue::Single(snapshot) => Some(snapshot),
            CacheValue::Pages(_) => None,
        }
    }

    pub fn error(&self) -> Option<SyncError> {
        self.state().error
    }

    pub fn listener_state(&self) -> Option<ListenerState> {
        self.context.subscriptions.listener_state(&self.key)
    }

    /// State changes for this key.
    pub fn watch(&self) -> &CacheWatch {
        &self.watch
    }

    /// Read again, or attach the listener if it is idle or failed. A live
    /// key that is already attached is left alone.
    ///
    /// The returned future owns everything it needs; it may outlive the
    /// handle, in which case its result is discarded.
    pub fn refetch(&self) -> BoxFuture<'static, ()> {
        let context = Arc::clone(&self.context);
        let key = self.key.clone();
        let reference = self.reference.clone();
        let options = self.options.clone();
        async move { context.run_query(&key, &reference, &options).await }.boxed()
    }

    /// Point the handle at a different key. The old key is released, and
    /// its listener torn down if this was its last consumer, before the
    /// new key is acquired.
    pub fn rebind(&mut self, key: QueryKey, reference: impl Into<Reference>) {
        self.reference = reference.into();
        if self.guard.as_ref().is_some_and(|guard| guard.key() == &key) {
            return;
        }

        debug!(from = %self.key, to = %key, "rebinding query handle");
        self.guard = None;
        self.watch = self.context.cache.subscribe(&key);
        self.guard = Some(self.context.subscriptions.acquire(&key));
        self.key = key;
    }
}

/// A consumer of one paginated query. Dropping the last handle on a root
/// tears down every page.
pub struct InfiniteQueryHandle {
    context: Arc<EngineContext>,
    coordinator: Arc<PageCoordinator>,
    watch: CacheWatch,
}

impl InfiniteQueryHandle {
    pub fn key(&self) -> &QueryKey {
        self.coordinator.root()
    }

    pub fn state(&self) -> CacheState {
        self.cache().get(self.key()).unwrap_or_default()
    }

    pub fn status(&self) -> QueryStatus {
        self.state().status
    }

    /// Loaded pages in order.
    pub fn data(&self) -> Option<PagedResult> {
        match self.state().data? {
            CacheValue::Pages(pages) => Some(pages),
            CacheValue::Single(_) => None,
        }
    }

    pub fn error(&self) -> Option<SyncError> {
        self.state().error
    }

    pub fn watch(&self) -> &CacheWatch {
        &self.watch
    }

    /// Discard all pages and load page 0 again.
    pub fn refetch(&self) -> BoxFuture<'static, ()> {
        self.coordinator.initialize()
    }

    /// Load the next page. Repeated calls while a page is loading, or
    /// after the last page, do nothing.
    pub fn fetch_next_page(&self) -> BoxFuture<'static, ()> {
        self.coordinator.fetch_next_page()
    }

    pub fn has_next_page(&self) -> bool {
        self.coordinator.has_next_page()
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.coordinator.is_fetching_next_page()
    }

    /// Number of loaded pages.
    pub fn page_count(&self) -> usize {
        self.coordinator.page_count()
    }

    /// Reference page `index` was created with.
    pub fn page_reference(&self, index: usize) -> Option<QueryRef> {
        self.coordinator.page_reference(index)
    }

    fn cache(&self) -> &Arc<dyn CacheBinding> {
        self.coordinator.cache()
    }
}

impl Drop for InfiniteQueryHandle {
    fn drop(&mut self) {
        self.context.release_pages(self.coordinator.root());
    }
}
