//! Cache binding for query results.
//!
//! The engine writes canonical results into a [`CacheBinding`]; the cache
//! owns status tracking, selection transforms and disposal:
//! - `Fetching` marks a read or attach in progress
//! - `Data` fully replaces the stored value
//! - `Error` records a failure but keeps the last good value
//!
//! [`MemoryCache`] is an in-process binding whose watchers receive state
//! changes over bounded channels.
//!
//! # Example
//!
//! ```ignore
//! let cache = MemoryCache::new();
//! let watch = cache.subscribe(&query_key!["todos"]);
//!
//! while let Ok(state) = watch.recv() {
//!     println!("{:?}: {:?}", state.status, state.data);
//! }
//! ```

mod memory;
mod types;

pub use memory::{MemoryCache, MemoryCacheConfig, Selector};
pub use types::{
    CacheBinding, CacheState, CacheUpdate, CacheValue, CacheWatch, PagedResult, QueryStatus,
};
