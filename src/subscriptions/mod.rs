//! Per-key listener lifecycle.
//!
//! The subscription manager guarantees at most one open listener per
//! query key:
//! - Consumers hold reference-counted guards; the last guard to drop
//!   tears the entry down and detaches its listener
//! - Listener state is an explicit `Idle → Attaching → Active` machine,
//!   with `Errored` after a listener failure
//! - Attach and fetch operations carry generation tokens, and results
//!   from superseded operations are discarded
//!
//! # Example
//!
//! ```ignore
//! let manager = Arc::new(SubscriptionManager::new());
//! let guard = manager.acquire(&key);
//!
//! manager.attach(&key, &*store, &reference, ListenOptions::default(), mode, sink);
//! assert!(manager.listener_state(&key).unwrap().is_attached());
//!
//! drop(guard); // listener detached here
//! ```

mod manager;
mod types;

pub(crate) use manager::{ConsumerGuard, SubscriptionManager};
pub(crate) use types::{CacheSink, Generation, SnapshotSink};
pub use types::ListenerState;
