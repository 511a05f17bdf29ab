//! Cursor-based pagination over fetches and listeners.
//!
//! A paginated query is an ordered sequence of pages sharing one root
//! key. Page `i` is loaded under `root.page(i)`, either read once or kept
//! live, and the aggregate of all loaded pages is written to the root key
//! whenever any page changes.
//!
//! The reference of page `i + 1` is derived from page `i`'s snapshot by a
//! caller-supplied function. It is fixed when page `i + 1` is created:
//! later live changes to page `i` never move the cursor.
//!
//! Every handle on a root key shares one sequence, reference counted by
//! the engine. The last handle to drop tears the pages down.

mod coordinator;
mod types;

pub(crate) use coordinator::PageCoordinator;
pub use types::NextReferenceFn;
