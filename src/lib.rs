//! # livequery
//!
//! Keeps an identity-keyed reactive cache in sync with a realtime
//! document store.
//!
//! ## Core Concepts
//!
//! - **Query keys**: structural identity of a query; everything is keyed by it
//! - **Normalization**: raw snapshots or extracted records, one canonical shape
//! - **Subscriptions**: at most one live listener per key, reference counted
//! - **Pagination**: cursor-derived pages over the same fetch/listen primitives
//! - **Named queries**: bundle lookups resolved once and shared
//!
//! ## Example
//!
//! ```ignore
//! use livequery::{query_key, MemoryCache, QueryOptions, QueryRef, SyncEngine};
//!
//! let engine = SyncEngine::new(store, Arc::new(MemoryCache::new()));
//!
//! // One-shot read
//! let todos = engine
//!     .read(query_key!["todos"], QueryRef::collection("todos"), QueryOptions::default())
//!     .await?;
//!
//! // Live listener, ids injected into each record
//! let user = engine
//!     .live_read(
//!         query_key!["users", "alice"],
//!         QueryRef::document("users/alice"),
//!         QueryOptions::live().with_id_field("id"),
//!     )
//!     .await?;
//!
//! while let Ok(state) = user.watch().recv() {
//!     println!("{:?}", state.data);
//! }
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod key;
pub mod named;
pub mod normalize;
pub mod pagination;
pub mod remote;
pub mod subscriptions;
pub mod types;

#[doc(hidden)]
pub use serde_json as __json;

// Re-exports
pub use cache::{
    CacheBinding, CacheState, CacheUpdate, CacheValue, CacheWatch, MemoryCache,
    MemoryCacheConfig, PagedResult, QueryStatus,
};
pub use engine::{EngineConfig, InfiniteQueryHandle, QueryHandle, SyncEngine};
pub use error::{RemoteError, Result, SyncError};
pub use fetch::FetchExecutor;
pub use key::QueryKey;
pub use named::NamedQueryResolver;
pub use normalize::{normalize, NormalizeMode};
pub use pagination::NextReferenceFn;
pub use remote::{ListenOptions, ListenerRegistration, RemoteStore, SnapshotCallback};
pub use subscriptions::ListenerState;
pub use types::*;
