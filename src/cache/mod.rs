//! Client-side response cache.
//!
//! Three layers, leaves first:
//!
//! - **Storage**: a uniform key/value contract over three backends
//!   (durable global, durable per session, process memory).
//! - **Engine**: versioned, TTL-aware read/write/invalidate over a backend.
//! - **Coalescer**: at most one outstanding fetch per cache key.
//!
//! ## Configuration
//!
//! Durable backends are enabled by pointing `storage.directory` at a writable
//! directory in `hc.toml`:
//!
//! ```toml
//! [storage]
//! directory = "/var/lib/hc"
//! quota_bytes = 5242880
//! ```
//!
//! Without it only the memory backend is available and every other backend
//! behaves as a permanent miss.

mod backend;
mod clock;
mod coalescer;
mod engine;
pub mod keys;
mod storage;

pub use backend::{Backend, UnknownBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coalescer::{METRIC_FETCH_COALESCED, METRIC_FETCH_MS, RequestCoalescer};
pub use engine::{
    CACHE_VERSION, CacheEngine, CacheEntry, METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATED,
    METRIC_CACHE_MISS, METRIC_CACHE_STALE, METRIC_CACHE_WRITE_FAILED,
};
pub use keys::{NAMESPACE, cache_key, namespaced};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError, StorageSet};
