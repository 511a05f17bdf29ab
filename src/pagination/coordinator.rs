//! Page sequence coordinator.

use crate::cache::{CacheBinding, CacheUpdate, CacheValue, PagedResult};
use crate::engine::EngineContext;
use crate::error::SyncError;
use crate::key::QueryKey;
use crate::normalize::NormalizeMode;
use crate::remote::ListenOptions;
use crate::subscriptions::SnapshotSink;
use crate::types::{QueryOptions, QueryRef, Reference, ResultSnapshot};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use super::types::{NextCursor, NextReferenceFn, Page, PageSlot};

#[derive(Default)]
struct PageSet {
    /// Bumped on every reset; deliveries from older epochs are dropped.
    epoch: u64,
    pages: Vec<Page>,
    closed: bool,
}

impl PageSet {
    /// Loaded prefix of the page sequence.
    fn aggregate(&self) -> PagedResult {
        PagedResult {
            pages: self
                .pages
                .iter()
                .map_while(|page| page.snapshot.clone())
                .collect(),
        }
    }
}

/// Drives the pages of one paginated query.
pub(crate) struct PageCoordinator {
    context: Arc<EngineContext>,
    root: QueryKey,
    reference: Reference,
    options: QueryOptions,
    next_reference: NextReferenceFn,
    pages: Mutex<PageSet>,
}

impl PageCoordinator {
    pub(crate) fn new(
        context: Arc<EngineContext>,
        root: QueryKey,
        reference: Reference,
        options: QueryOptions,
        next_reference: NextReferenceFn,
    ) -> Self {
        Self {
            context,
            root,
            reference,
            options,
            next_reference,
            pages: Mutex::new(PageSet::default()),
        }
    }

    pub(crate) fn root(&self) -> &QueryKey {
        &self.root
    }

    pub(crate) fn cache(&self) -> &Arc<dyn CacheBinding> {
        &self.context.cache
    }

    /// Discard every page and load page 0 from the initial reference.
    pub(crate) fn initialize(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let (epoch, stale) = {
            let mut set = self.pages.lock();
            if set.closed {
                return future::ready(()).boxed();
            }
            set.epoch += 1;
            (set.epoch, std::mem::take(&mut set.pages))
        };
        // Old page listeners go away before page 0 attaches.
        drop(stale);

        let coordinator = Arc::clone(self);
        async move {
            let context = &coordinator.context;
            context.cache.set(&coordinator.root, CacheUpdate::Fetching);

            let reference = match context.resolve_reference(&coordinator.reference).await {
                Ok(reference) => reference,
                Err(error) => {
                    if coordinator.is_epoch(epoch) {
                        context.cache.set(&coordinator.root, CacheUpdate::Error(error));
                    }
                    return;
                }
            };

            if let Some(slot) = coordinator.push_page(epoch, 0, reference) {
                coordinator.load_page(slot).await;
            }
        }
        .boxed()
    }

    /// Bring the sequence up for a new handle. A live sequence that already
    /// has pages is joined as is; otherwise this is [`initialize`](Self::initialize).
    pub(crate) fn start(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        if self.options.subscribe && !self.pages.lock().pages.is_empty() {
            trace!(key = %self.root, "joining live page sequence");
            return future::ready(()).boxed();
        }
        self.initialize()
    }

    /// Load the page after the tail. No-op when the tail is still loading,
    /// the sequence has ended, or the page limit is reached.
    pub(crate) fn fetch_next_page(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let Some(slot) = self.reserve_next_page() else {
            return future::ready(()).boxed();
        };
        let coordinator = Arc::clone(self);
        async move { coordinator.load_page(slot).await }.boxed()
    }

    /// Tear down every page. Results still in flight are dropped.
    pub(crate) fn shutdown(&self) {
        let stale = {
            let mut set = self.pages.lock();
            set.closed = true;
            set.epoch += 1;
            std::mem::take(&mut set.pages)
        };
        debug!(key = %self.root, pages = stale.len(), "shutting down pages");
        drop(stale);
    }

    // --- Inspection ---

    pub(crate) fn has_next_page(&self) -> bool {
        let set = self.pages.lock();
        self.next_slot_reference(&set).is_some()
    }

    pub(crate) fn is_fetching_next_page(&self) -> bool {
        let set = self.pages.lock();
        set.pages.len() > 1 && set.pages.last().is_some_and(|page| !page.is_loaded())
    }

    /// Number of loaded pages.
    pub(crate) fn page_count(&self) -> usize {
        self.pages.lock().pages.iter().filter(|p| p.is_loaded()).count()
    }

    pub(crate) fn page_reference(&self, index: usize) -> Option<QueryRef> {
        self.pages
            .lock()
            .pages
            .get(index)
            .map(|page| page.reference.clone())
    }

    // --- Internals ---

    fn is_epoch(&self, epoch: u64) -> bool {
        self.pages.lock().epoch == epoch
    }

    /// Reference for the next page, if one may be requested now.
    fn next_slot_reference(&self, set: &PageSet) -> Option<QueryRef> {
        let tail = set.pages.last()?;
        if !tail.is_loaded() {
            return None;
        }
        if let Some(max) = self.context.config.max_pages {
            if set.pages.len() >= max {
                return None;
            }
        }
        match &tail.next {
            NextCursor::Next(reference) => Some(reference.clone()),
            NextCursor::Pending | NextCursor::End => None,
        }
    }

    fn reserve_next_page(&self) -> Option<PageSlot> {
        let (epoch, index, reference) = {
            let set = self.pages.lock();
            let reference = self.next_slot_reference(&set)?;
            (set.epoch, set.pages.len(), reference)
        };
        self.push_page(epoch, index, reference)
    }

    /// Append a pending page at `index` if the sequence is still where the
    /// caller saw it.
    fn push_page(&self, epoch: u64, index: usize, reference: QueryRef) -> Option<PageSlot> {
        // Acquired outside the page lock; the manager never calls back into us
        // while holding its own lock.
        let guard = self.context.subscriptions.acquire(&self.root.page(index));

        let mut set = self.pages.lock();
        if set.closed || set.epoch != epoch || set.pages.len() != index {
            drop(set);
            drop(guard);
            return None;
        }
        set.pages.push(Page {
            reference: reference.clone(),
            snapshot: None,
            next: NextCursor::Pending,
            _guard: guard,
        });

        Some(PageSlot {
            epoch,
            index,
            reference,
        })
    }

    async fn load_page(self: Arc<Self>, slot: PageSlot) {
        let context = &self.context;
        let key = self.root.page(slot.index);
        let mode = NormalizeMode::from(&self.options);
        let sink = PageSink {
            coordinator: Arc::downgrade(&self),
            epoch: slot.epoch,
            index: slot.index,
        };

        debug!(key = %self.root, page = slot.index, "loading page");
        context.cache.set(&self.root, CacheUpdate::Fetching);

        if self.options.subscribe {
            let options = ListenOptions {
                include_metadata_changes: self.options.include_metadata_changes,
            };
            context.subscriptions.attach(
                &key,
                &*context.store,
                &slot.reference,
                options,
                mode,
                Arc::new(sink),
            );
        } else {
            let Some(generation) = context.subscriptions.begin_fetch(&key) else {
                return;
            };
            context
                .fetcher
                .execute(
                    &context.subscriptions,
                    &key,
                    generation,
                    &slot.reference,
                    self.options.source,
                    &mode,
                    &sink,
                )
                .await;
        }
    }

    fn on_page_snapshot(&self, epoch: u64, index: usize, snapshot: ResultSnapshot) {
        // Derived before the page lock is taken; the callback may call back
        // into the handle.
        let next = match (self.next_reference)(&snapshot) {
            Some(reference) => NextCursor::Next(reference),
            None => NextCursor::End,
        };

        let aggregate = {
            let mut set = self.pages.lock();
            if set.epoch != epoch {
                trace!(key = %self.root, page = index, "dropping page from old epoch");
                return;
            }
            let is_tail = index + 1 == set.pages.len();
            let Some(page) = set.pages.get_mut(index) else {
                return;
            };
            // Once a later page exists its reference is frozen, so the
            // cursor of an earlier page is never recomputed.
            if is_tail {
                page.next = next;
            }
            page.snapshot = Some(snapshot);
            set.aggregate()
        };

        self.context.cache.set(
            &self.root,
            CacheUpdate::Data(CacheValue::Pages(aggregate)),
        );
    }

    fn on_page_error(&self, epoch: u64, index: usize, error: SyncError) {
        let removed = {
            let mut set = self.pages.lock();
            if set.epoch != epoch {
                return;
            }
            // A page that never loaded is dropped so it can be requested again.
            let pending = set.pages.get(index).is_some_and(|page| !page.is_loaded());
            if pending {
                set.pages.split_off(index)
            } else {
                Vec::new()
            }
        };
        drop(removed);

        debug!(key = %self.root, page = index, error = %error, "page failed");
        self.context.cache.set(&self.root, CacheUpdate::Error(error));
    }
}

/// Routes one page's results back to its coordinator.
struct PageSink {
    coordinator: Weak<PageCoordinator>,
    epoch: u64,
    index: usize,
}

impl SnapshotSink for PageSink {
    fn deliver(&self, snapshot: ResultSnapshot) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_page_snapshot(self.epoch, self.index, snapshot);
        }
    }

    fn fail(&self, error: SyncError) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_page_error(self.epoch, self.index, error);
        }
    }
}
