//! Key/value storage backends.
//!
//! All three backends share the [`Storage`] contract. Durable backends keep
//! their contents in JSON files under the configured storage directory; the
//! memory backend lives and dies with the process.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::Backend;

const GLOBAL_FILE_NAME: &str = "global.json";
const SESSION_DIR_NAME: &str = "sessions";
const SESSION_FILE_PREFIX: &str = "session-";
/// Session files untouched for this long belong to a process that never
/// reached its cleanup.
const ORPHANED_SESSION_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: u64, quota: u64 },
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Uniform key/value contract shared by every backend.
///
/// Reads never fail; a backend that cannot serve a key reports it as absent.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;

    fn len(&self) -> usize;

    /// Key at position `index` in the backend's enumeration order.
    fn key(&self, index: usize) -> Option<String>;

    /// Snapshot of every key currently stored.
    fn keys(&self) -> Vec<String> {
        (0..self.len()).filter_map(|index| self.key(index)).collect()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Entry map
// ============================================================================

type Entries = BTreeMap<String, String>;

/// Sorted key/value map shared by both backends.
///
/// A panic while a guard is held poisons the lock; the map is still
/// structurally sound, so access continues with a warning naming the backend.
#[derive(Debug)]
struct EntryMap {
    label: &'static str,
    entries: RwLock<Entries>,
}

impl EntryMap {
    fn new(label: &'static str, entries: Entries) -> Self {
        Self {
            label,
            entries: RwLock::new(entries),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|poisoned| {
            warn!(backend = self.label, "Storage lock poisoned; continuing with recovered entries");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|poisoned| {
            warn!(backend = self.label, "Storage lock poisoned; continuing with recovered entries");
            poisoned.into_inner()
        })
    }

    fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.read().keys().nth(index).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}

// ============================================================================
// Memory backend
// ============================================================================

/// Process-memory-only storage.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: EntryMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: EntryMap::new(Backend::Memory.as_str(), Entries::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key)
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries.write().clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.entries.key(index)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys()
    }
}

// ============================================================================
// File backend
// ============================================================================

/// JSON-file-backed storage.
///
/// The whole map is held in memory and rewritten to disk after every mutation.
/// A mutation that fails to persist is rolled back so memory and disk agree.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    quota_bytes: Option<u64>,
    remove_on_drop: bool,
    entries: EntryMap,
}

impl FileStorage {
    /// Open storage that survives process restarts until cleared.
    pub fn durable(path: impl Into<PathBuf>, quota_bytes: Option<u64>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = load_entries(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "Opened durable storage");
        Ok(Self {
            path,
            quota_bytes,
            remove_on_drop: false,
            entries: EntryMap::new(Backend::Global.as_str(), entries),
        })
    }

    /// Create storage scoped to this session.
    ///
    /// Each session gets a fresh file under `dir`; the file is deleted when the
    /// storage is dropped.
    pub fn session(dir: impl AsRef<Path>, quota_bytes: Option<u64>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{SESSION_FILE_PREFIX}{}.json", Uuid::new_v4()));
        debug!(path = %path.display(), "Opened session storage");
        Ok(Self {
            path,
            quota_bytes,
            remove_on_drop: true,
            entries: EntryMap::new(Backend::Session.as_str(), Entries::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn load_entries(path: &Path) -> Result<Entries, StorageError> {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Discarding unreadable storage file"
                );
                Ok(Entries::new())
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Entries::new()),
        Err(err) => Err(err.into()),
    }
}

fn footprint(entries: &Entries) -> u64 {
    entries
        .iter()
        .map(|(key, value)| (key.len() + value.len()) as u64)
        .sum()
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key)
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut entries = self.entries.write();

        if let Some(quota) = self.quota_bytes {
            let replaced = entries
                .get(key)
                .map_or(0, |old| (key.len() + old.len()) as u64);
            let needed = footprint(&entries) - replaced + (key.len() + value.len()) as u64;
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }

        let previous = entries.insert(key.to_string(), value);
        if let Err(err) = self.persist(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(err) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        let previous = std::mem::take(&mut *entries);
        if let Err(err) = self.persist(&entries) {
            *entries = previous;
            return Err(err);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn key(&self, index: usize) -> Option<String> {
        self.entries.key(index)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys()
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if !self.remove_on_drop {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed session storage"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                error = %err,
                "Failed to remove session storage"
            ),
        }
    }
}

// ============================================================================
// Backend set
// ============================================================================

/// The three storage backends, addressed by [`Backend`].
///
/// The memory backend always exists. Durable backends are optional; an absent
/// backend behaves as permanently empty and rejects every write.
#[derive(Clone)]
pub struct StorageSet {
    global: Option<Arc<dyn Storage>>,
    session: Option<Arc<dyn Storage>>,
    memory: Arc<dyn Storage>,
}

impl StorageSet {
    pub fn new(
        global: Option<Arc<dyn Storage>>,
        session: Option<Arc<dyn Storage>>,
        memory: Arc<dyn Storage>,
    ) -> Self {
        Self {
            global,
            session,
            memory,
        }
    }

    /// Only the memory backend; durable backends are unavailable.
    pub fn memory_only() -> Self {
        Self::new(None, None, Arc::new(MemoryStorage::new()))
    }

    /// All three backends, each held in process memory.
    pub fn in_memory() -> Self {
        Self::new(
            Some(Arc::new(MemoryStorage::new())),
            Some(Arc::new(MemoryStorage::new())),
            Arc::new(MemoryStorage::new()),
        )
    }

    /// Open file-backed durable backends under `directory`.
    ///
    /// Without a directory only the memory backend is available.
    pub fn open(directory: Option<&Path>, quota_bytes: Option<u64>) -> Result<Self, StorageError> {
        let Some(directory) = directory else {
            return Ok(Self::memory_only());
        };

        let global = FileStorage::durable(directory.join(GLOBAL_FILE_NAME), quota_bytes)?;
        let session = FileStorage::session(directory.join(SESSION_DIR_NAME), quota_bytes)?;
        sweep_orphaned_sessions(&directory.join(SESSION_DIR_NAME), ORPHANED_SESSION_AGE);

        Ok(Self::new(
            Some(Arc::new(global)),
            Some(Arc::new(session)),
            Arc::new(MemoryStorage::new()),
        ))
    }

    pub fn get(&self, backend: Backend) -> Option<&dyn Storage> {
        match backend {
            Backend::Global => self.global.as_deref(),
            Backend::Session => self.session.as_deref(),
            Backend::Memory => Some(self.memory.as_ref()),
        }
    }

    pub fn is_available(&self, backend: Backend) -> bool {
        self.get(backend).is_some()
    }

    pub fn available(&self) -> Vec<Backend> {
        Backend::ALL
            .into_iter()
            .filter(|backend| self.is_available(*backend))
            .collect()
    }
}

impl std::fmt::Debug for StorageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSet")
            .field("available", &self.available())
            .finish()
    }
}

/// Removes session files left behind by processes that exited without
/// running their cleanup. Returns how many were removed.
fn sweep_orphaned_sessions(dir: &Path, max_age: Duration) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "Failed to scan session directory");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_session_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SESSION_FILE_PREFIX) && name.ends_with(".json"));
        if !is_session_file {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_none_or(|age| age < max_age) {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "Failed to remove orphaned session storage"
            ),
        }
    }

    if removed > 0 {
        debug!(removed, path = %dir.display(), "Swept orphaned session storage");
    }
    removed
}
