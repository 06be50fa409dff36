//! Versioned, TTL-aware cache operations over a [`StorageSet`].
//!
//! Entries are stored as JSON envelopes under namespaced keys. Stale entries
//! (wrong schema version or past their expiry) are removed lazily on read;
//! there is no background sweep. Storage failures never reach the caller:
//! they are logged and the operation degrades to a miss or a no-op.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::backend::Backend;
use super::clock::{Clock, SystemClock};
use super::keys::{NAMESPACE, namespaced};
use super::storage::{Storage, StorageSet};

/// Bump when the envelope or payload layout changes; older entries then
/// self-invalidate on first read.
pub const CACHE_VERSION: u32 = 1;

pub const METRIC_CACHE_HIT: &str = "hc_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "hc_cache_miss_total";
pub const METRIC_CACHE_STALE: &str = "hc_cache_stale_total";
pub const METRIC_CACHE_WRITE_FAILED: &str = "hc_cache_write_failed_total";
pub const METRIC_CACHE_INVALIDATED: &str = "hc_cache_invalidated_total";

/// Persisted cache envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Value,
    /// Absolute expiry in Unix milliseconds; `None` never expires.
    pub expires_at: Option<i64>,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    Version,
    Expired,
}

/// What a stored envelope turned out to hold.
#[derive(Debug)]
enum Decoded {
    Fresh(CacheEntry),
    Stale(Staleness),
    Unreadable(serde_json::Error),
}

impl CacheEntry {
    /// The version tag is read before the rest of the envelope, so entries
    /// written under any older layout are recognised as stale rather than
    /// unreadable.
    fn decode(raw: &str, now_millis: i64) -> Decoded {
        let envelope: Value = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => return Decoded::Unreadable(err),
        };

        let version = envelope.get("version").and_then(Value::as_u64);
        if version != Some(u64::from(CACHE_VERSION)) {
            return Decoded::Stale(Staleness::Version);
        }

        let entry: CacheEntry = match serde_json::from_value(envelope) {
            Ok(entry) => entry,
            Err(err) => return Decoded::Unreadable(err),
        };
        match entry.expires_at {
            Some(expires_at) if now_millis > expires_at => Decoded::Stale(Staleness::Expired),
            _ => Decoded::Fresh(entry),
        }
    }
}

/// Cache operations over every configured backend.
pub struct CacheEngine {
    storages: StorageSet,
    clock: Arc<dyn Clock>,
}

impl CacheEngine {
    pub fn new(storages: StorageSet) -> Self {
        Self::with_clock(storages, Arc::new(SystemClock))
    }

    pub fn with_clock(storages: StorageSet, clock: Arc<dyn Clock>) -> Self {
        Self { storages, clock }
    }

    pub fn storages(&self) -> &StorageSet {
        &self.storages
    }

    fn storage(&self, backend: Backend, op: &'static str) -> Option<&dyn Storage> {
        let storage = self.storages.get(backend);
        if storage.is_none() {
            debug!(op, backend = %backend, "Storage backend unavailable");
        }
        storage
    }

    /// Return the cached value for `key`, or `None` on miss.
    pub fn read(&self, key: &str, backend: Backend) -> Option<Value> {
        let storage = self.storage(backend, "read")?;
        let full_key = namespaced(key);

        let Some(raw) = storage.get(&full_key) else {
            counter!(METRIC_CACHE_MISS, "backend" => backend.as_str()).increment(1);
            return None;
        };

        let entry = match CacheEntry::decode(&raw, self.clock.now_millis()) {
            Decoded::Fresh(entry) => entry,
            Decoded::Unreadable(err) => {
                warn!(key, backend = %backend, error = %err, "Error reading cached entry");
                counter!(METRIC_CACHE_MISS, "backend" => backend.as_str()).increment(1);
                return None;
            }
            Decoded::Stale(reason) => {
                debug!(key, backend = %backend, reason = ?reason, "Dropping stale cache entry");
                if let Err(err) = storage.remove(&full_key) {
                    warn!(key, backend = %backend, error = %err, "Failed to remove stale cache entry");
                }
                counter!(METRIC_CACHE_STALE, "backend" => backend.as_str()).increment(1);
                counter!(METRIC_CACHE_MISS, "backend" => backend.as_str()).increment(1);
                return None;
            }
        };

        counter!(METRIC_CACHE_HIT, "backend" => backend.as_str()).increment(1);
        Some(entry.data)
    }

    /// Store `value` under `key`. A zero or absent `ttl` never expires.
    ///
    /// Returns false when the value could not be cached.
    pub fn write(&self, key: &str, value: &Value, ttl: Option<Duration>, backend: Backend) -> bool {
        let Some(storage) = self.storage(backend, "write") else {
            return false;
        };

        let expires_at = ttl.filter(|ttl| !ttl.is_zero()).map(|ttl| {
            let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            self.clock.now_millis().saturating_add(ttl_millis)
        });
        let entry = CacheEntry {
            data: value.clone(),
            expires_at,
            version: CACHE_VERSION,
        };

        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key, backend = %backend, error = %err, "Error encoding cache entry");
                counter!(METRIC_CACHE_WRITE_FAILED, "backend" => backend.as_str()).increment(1);
                return false;
            }
        };

        match storage.set(&namespaced(key), encoded) {
            Ok(()) => true,
            Err(err) => {
                warn!(key, backend = %backend, error = %err, "Error writing cache entry");
                counter!(METRIC_CACHE_WRITE_FAILED, "backend" => backend.as_str()).increment(1);
                false
            }
        }
    }

    /// Remove every entry whose logical key starts with `prefix`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate_prefix(&self, prefix: &str, backend: Backend) -> usize {
        let removed = self.remove_matching(&namespaced(prefix), backend, "invalidate_prefix");
        info!(prefix, backend = %backend, removed, "Invalidated cache prefix");
        removed
    }

    /// Remove every namespaced entry in `backend`, leaving foreign keys alone.
    pub fn clear_all(&self, backend: Backend) -> usize {
        let removed = self.remove_matching(NAMESPACE, backend, "clear_all");
        info!(backend = %backend, removed, "Cleared cache backend");
        removed
    }

    fn remove_matching(&self, full_prefix: &str, backend: Backend, op: &'static str) -> usize {
        let Some(storage) = self.storage(backend, op) else {
            return 0;
        };

        // Collect first so removal never disturbs the enumeration.
        let matches: Vec<String> = storage
            .keys()
            .into_iter()
            .filter(|key| key.starts_with(full_prefix))
            .collect();

        let mut removed = 0;
        for key in matches {
            match storage.remove(&key) {
                Ok(()) => removed += 1,
                Err(err) => warn!(
                    op,
                    key = %key,
                    backend = %backend,
                    error = %err,
                    "Failed to remove cache entry"
                ),
            }
        }

        counter!(METRIC_CACHE_INVALIDATED, "backend" => backend.as_str()).increment(removed as u64);
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;
    use time::macros::datetime;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::storage::{FileStorage, MemoryStorage};

    fn engine() -> (CacheEngine, ManualClock) {
        let clock = ManualClock::new(datetime!(2024-06-01 12:00 UTC));
        let engine = CacheEngine::with_clock(StorageSet::in_memory(), Arc::new(clock.clone()));
        (engine, clock)
    }

    #[test]
    fn write_then_read_returns_value_in_every_backend() {
        let (engine, _) = engine();
        let value = json!({"success": true, "data": [1, 2, 3]});

        for backend in Backend::ALL {
            assert!(engine.write("getProducts_{}", &value, Some(Duration::from_secs(60)), backend));
            assert_eq!(engine.read("getProducts_{}", backend), Some(value.clone()));
        }
    }

    #[test]
    fn entries_are_stored_under_namespace() {
        let (engine, _) = engine();
        engine.write("getStores_{}", &json!(1), None, Backend::Memory);

        let storage = engine.storages().get(Backend::Memory).unwrap();
        assert_eq!(storage.keys(), vec!["hc_getStores_{}".to_string()]);
    }

    #[test]
    fn expired_entry_is_absent_and_removed() {
        let (engine, clock) = engine();
        engine.write("k", &json!("v"), Some(Duration::from_secs(10)), Backend::Session);

        clock.advance(Duration::from_secs(10));
        assert_eq!(engine.read("k", Backend::Session), Some(json!("v")));

        clock.advance(Duration::from_millis(1));
        assert_eq!(engine.read("k", Backend::Session), None);

        let storage = engine.storages().get(Backend::Session).unwrap();
        assert!(storage.get("hc_k").is_none());
    }

    #[test]
    fn zero_or_missing_ttl_never_expires() {
        let (engine, clock) = engine();
        engine.write("forever", &json!(1), None, Backend::Global);
        engine.write("zero", &json!(2), Some(Duration::ZERO), Backend::Global);

        clock.advance(Duration::from_secs(60 * 60 * 24 * 365));
        assert_eq!(engine.read("forever", Backend::Global), Some(json!(1)));
        assert_eq!(engine.read("zero", Backend::Global), Some(json!(2)));
    }

    #[test]
    fn old_schema_version_is_absent_and_removed() {
        let (engine, _) = engine();
        let storage = engine.storages().get(Backend::Global).unwrap();
        let stale = CacheEntry {
            data: json!("old"),
            expires_at: None,
            version: CACHE_VERSION - 1,
        };
        storage
            .set("hc_k", serde_json::to_string(&stale).unwrap())
            .unwrap();

        assert_eq!(engine.read("k", Backend::Global), None);
        assert!(storage.get("hc_k").is_none());
    }

    #[test]
    fn old_layout_entry_is_absent_and_removed() {
        let (engine, _) = engine();
        let storage = engine.storages().get(Backend::Session).unwrap();
        storage
            .set("hc_k", r#"{"payload":[1],"expiresAt":"soon","version":0}"#.into())
            .unwrap();
        storage.set("hc_untagged", "[1,2,3]".into()).unwrap();

        assert_eq!(engine.read("k", Backend::Session), None);
        assert_eq!(engine.read("untagged", Backend::Session), None);
        assert!(storage.get("hc_k").is_none());
        assert!(storage.get("hc_untagged").is_none());
    }

    #[test]
    fn entry_is_fresh_at_exact_expiry_instant() {
        let (engine, clock) = engine();
        let written_at = clock.now();
        engine.write("k", &json!("v"), Some(Duration::from_secs(30)), Backend::Memory);

        clock.set(written_at + Duration::from_secs(30));
        assert_eq!(engine.read("k", Backend::Memory), Some(json!("v")));

        clock.set(written_at + Duration::from_millis(30_001));
        assert_eq!(engine.read("k", Backend::Memory), None);
    }

    #[test]
    fn malformed_entry_reads_as_miss() {
        let (engine, _) = engine();
        let storage = engine.storages().get(Backend::Memory).unwrap();
        storage.set("hc_k", "{not json".into()).unwrap();

        assert_eq!(engine.read("k", Backend::Memory), None);
        assert_eq!(storage.get("hc_k").as_deref(), Some("{not json"));
    }

    #[test]
    fn unavailable_backend_behaves_as_miss() {
        let engine = CacheEngine::new(StorageSet::memory_only());
        assert!(!engine.write("k", &json!(1), None, Backend::Global));
        assert_eq!(engine.read("k", Backend::Global), None);
        assert_eq!(engine.invalidate_prefix("k", Backend::Session), 0);
        assert_eq!(engine.clear_all(Backend::Global), 0);
    }

    #[test]
    fn quota_failure_reports_not_cached() {
        let dir = TempDir::new().unwrap();
        let global = FileStorage::durable(dir.path().join("g.json"), Some(16)).unwrap();
        let storages = StorageSet::new(Some(Arc::new(global)), None, Arc::new(MemoryStorage::new()));
        let engine = CacheEngine::new(storages);

        assert!(!engine.write("k", &json!("a value that is far too large"), None, Backend::Global));
        assert_eq!(engine.read("k", Backend::Global), None);
    }

    #[test]
    fn invalidate_prefix_targets_one_backend_and_prefix() {
        let (engine, _) = engine();
        let value = json!(true);
        engine.write("getCurrentOrders_{}", &value, None, Backend::Session);
        engine.write("getCurrentOrders_{\"page\":2}", &value, None, Backend::Session);
        engine.write("getOrderSessions_{}", &value, None, Backend::Session);
        engine.write("getCurrentOrders_{}", &value, None, Backend::Memory);

        assert_eq!(engine.invalidate_prefix("getCurrentOrders", Backend::Session), 2);

        assert_eq!(engine.read("getCurrentOrders_{}", Backend::Session), None);
        assert_eq!(engine.read("getCurrentOrders_{\"page\":2}", Backend::Session), None);
        assert_eq!(engine.read("getOrderSessions_{}", Backend::Session), Some(value.clone()));
        assert_eq!(engine.read("getCurrentOrders_{}", Backend::Memory), Some(value));
    }

    #[test]
    fn clear_all_leaves_foreign_keys() {
        let (engine, _) = engine();
        let storage = engine.storages().get(Backend::Global).unwrap();
        storage.set("theme", "dark".into()).unwrap();
        engine.write("a", &json!(1), None, Backend::Global);
        engine.write("b", &json!(2), None, Backend::Global);

        assert_eq!(engine.clear_all(Backend::Global), 2);
        assert_eq!(storage.keys(), vec!["theme".to_string()]);
    }

    #[test]
    fn entry_envelope_uses_camel_case() {
        let entry = CacheEntry {
            data: json!(1),
            expires_at: Some(5),
            version: CACHE_VERSION,
        };
        let encoded = serde_json::to_value(&entry).unwrap();
        assert_eq!(encoded, json!({"data": 1, "expiresAt": 5, "version": 1}));
    }
}
