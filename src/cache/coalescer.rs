//! In-flight request coalescing.
//!
//! At most one fetch runs per cache key. Callers that arrive while a fetch is
//! outstanding await the same shared future and observe the same result,
//! success or failure. The registry entry is removed by a drop guard owned by
//! the fetch itself, so it disappears on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::debug;

use super::backend::Backend;
use super::engine::CacheEngine;

pub const METRIC_FETCH_COALESCED: &str = "hc_fetch_coalesced_total";
pub const METRIC_FETCH_MS: &str = "hc_fetch_ms";

type SharedFetch<E> = Shared<BoxFuture<'static, Result<Value, E>>>;
type Registry<E> = Arc<DashMap<String, SharedFetch<E>>>;

pub struct RequestCoalescer<E> {
    engine: Arc<CacheEngine>,
    in_flight: Registry<E>,
}

impl<E> RequestCoalescer<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self {
            engine,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    /// Number of fetches currently outstanding.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Return the cached value for `key`, joining or starting a fetch on miss.
    ///
    /// A successful fetch is written to `backend` with `ttl` before any waiter
    /// sees it. A failed fetch is not cached and the key is immediately free
    /// for a fresh attempt.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Option<Duration>,
        backend: Backend,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
    {
        if let Some(hit) = self.engine.read(key, backend) {
            debug!(key, backend = %backend, "Cache hit");
            return Ok(hit);
        }

        // Lookup and insertion happen under the same shard lock.
        let pending = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                debug!(key, "Joining in-flight fetch");
                counter!(METRIC_FETCH_COALESCED).increment(1);
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                debug!(key, backend = %backend, "Starting fetch");
                let pending = self.start(key.to_string(), fetch, ttl, backend);
                vacant.insert(pending.clone());
                pending
            }
        };

        pending.await
    }

    fn start<F, Fut>(
        &self,
        key: String,
        fetch: F,
        ttl: Option<Duration>,
        backend: Backend,
    ) -> SharedFetch<E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let in_flight = Arc::clone(&self.in_flight);

        async move {
            let _guard = InFlightGuard {
                key: key.clone(),
                in_flight,
            };

            let started = Instant::now();
            let result = fetch().await;
            histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

            match &result {
                Ok(value) => {
                    engine.write(&key, value, ttl, backend);
                }
                Err(_) => debug!(key = %key, "Fetch failed; result not cached"),
            }
            result
        }
        .boxed()
        .shared()
    }
}

/// Removes a key from the in-flight registry when its fetch settles,
/// including by panic.
struct InFlightGuard<E> {
    key: String,
    in_flight: Registry<E>,
}

impl<E> Drop for InFlightGuard<E> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}
