//! Page bookkeeping types.

use crate::subscriptions::ConsumerGuard;
use crate::types::{QueryRef, ResultSnapshot};
use std::sync::Arc;

/// Derives the reference of the following page from a page's snapshot.
/// `None` means there are no more pages.
///
/// Called with no page or cache lock held, so it may inspect the handle
/// or the cache. It must not create or drop paginated handles.
pub type NextReferenceFn = Arc<dyn Fn(&ResultSnapshot) -> Option<QueryRef> + Send + Sync>;

/// What is known about the page after this one.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum NextCursor {
    /// The page has no snapshot yet.
    Pending,
    Next(QueryRef),
    /// Terminal: no further pages.
    End,
}

/// One fetched or subscribed page.
pub(crate) struct Page {
    /// Fixed when the page is created.
    pub(crate) reference: QueryRef,
    pub(crate) snapshot: Option<ResultSnapshot>,
    /// Recomputed only while this page is the tail.
    pub(crate) next: NextCursor,
    /// Keeps the page key observed; dropping it detaches the page listener.
    pub(crate) _guard: ConsumerGuard,
}

impl Page {
    pub(crate) fn is_loaded(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// A reserved page waiting to be loaded.
#[derive(Clone, Debug)]
pub(crate) struct PageSlot {
    pub(crate) epoch: u64,
    pub(crate) index: usize,
    pub(crate) reference: QueryRef,
}
