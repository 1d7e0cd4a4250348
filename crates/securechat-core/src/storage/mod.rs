//! Per-identity user data store.
//!
//! Holds string values grouped into named buckets (`storage_name -> key -> value`).
//! The in-memory map is the source of truth between calls to
//! [`UserDataStore::synchronize`], which flushes a snapshot to the configured
//! [`StorageBackend`].
//!
//! Locking: the bucket map is guarded by one `RwLock` that is only taken for
//! bucket lookup and creation. Every bucket carries its own `RwLock`, so
//! read-modify-write on one bucket never blocks another. Flushes are
//! serialized by a separate mutex so snapshots reach the backend in order.

mod backend;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use crate::error::Result;

pub use backend::{JsonFileBackend, MemoryBackend, StorageBackend};

/// Entries of a single bucket, ordered by key.
pub type BucketEntries = BTreeMap<String, String>;

/// Full store contents as handed to a [`StorageBackend`].
pub type Snapshot = BTreeMap<String, BucketEntries>;

/// One named bucket of key/value pairs.
///
/// Handles returned by [`UserDataStore::get_all_data`] stay valid after the
/// store hands them out; every mutation marks the owning store dirty.
#[derive(Debug)]
pub struct Bucket {
    entries: RwLock<BucketEntries>,
    dirty: Arc<AtomicBool>,
}

impl Bucket {
    fn new(entries: BucketEntries, dirty: Arc<AtomicBool>) -> Self {
        Self {
            entries: RwLock::new(entries),
            dirty,
        }
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&self, key: &str, value: &str) -> Option<String> {
        self.update(|entries| entries.insert(key.to_string(), value.to_string()))
    }

    /// Remove a value, returning it if it was present.
    pub fn remove(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(key);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Run `f` with exclusive access to the entries.
    ///
    /// This is the read-modify-write primitive: nothing else can observe or
    /// change the bucket while `f` runs.
    pub fn update<R>(&self, f: impl FnOnce(&mut BucketEntries) -> R) -> R {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut entries);
        self.dirty.store(true, Ordering::Release);
        result
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> BucketEntries {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Concurrent bucketed key/value store with an explicit flush point.
pub struct UserDataStore {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    dirty: Arc<AtomicBool>,
    flush: Mutex<()>,
    backend: Box<dyn StorageBackend>,
}

impl std::fmt::Debug for UserDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDataStore")
            .field("storage_names", &self.storage_names())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl Default for UserDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDataStore {
    /// Create an empty store backed by a [`MemoryBackend`].
    pub fn new() -> Self {
        Self::with_backend(Box::new(MemoryBackend::new()), Snapshot::new())
    }

    /// Open a store, rehydrating it from whatever `backend` last saved.
    pub fn open(backend: Box<dyn StorageBackend>) -> Result<Self> {
        let snapshot = backend.load()?;
        debug!(buckets = snapshot.len(), "Loaded user data store");
        Ok(Self::with_backend(backend, snapshot))
    }

    fn with_backend(backend: Box<dyn StorageBackend>, snapshot: Snapshot) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let buckets = snapshot
            .into_iter()
            .map(|(name, entries)| (name, Arc::new(Bucket::new(entries, Arc::clone(&dirty)))))
            .collect();
        Self {
            buckets: RwLock::new(buckets),
            dirty,
            flush: Mutex::new(()),
            backend,
        }
    }

    /// Return the bucket for `storage_name`, creating an empty one on first access.
    ///
    /// Creation happens under the map's write lock, so two threads asking for
    /// the same new bucket always receive the same handle.
    pub fn get_all_data(&self, storage_name: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.existing_bucket(storage_name) {
            return bucket;
        }
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            buckets
                .entry(storage_name.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket::new(BucketEntries::new(), Arc::clone(&self.dirty)))
                }),
        )
    }

    fn existing_bucket(&self, storage_name: &str) -> Option<Arc<Bucket>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(storage_name)
            .cloned()
    }

    /// Look up a single value. Absence is not an error.
    pub fn get_data(&self, storage_name: &str, key: &str) -> Option<String> {
        self.existing_bucket(storage_name)
            .and_then(|bucket| bucket.get(key))
    }

    /// Insert or replace a value.
    pub fn add_data(&self, storage_name: &str, key: &str, value: &str) {
        self.get_all_data(storage_name).insert(key, value);
    }

    /// Remove a value. No-op if absent.
    pub fn remove_data(&self, storage_name: &str, key: &str) {
        if let Some(bucket) = self.existing_bucket(storage_name) {
            bucket.remove(key);
        }
    }

    /// Atomically remove a value and return it.
    pub fn take_data(&self, storage_name: &str, key: &str) -> Option<String> {
        self.existing_bucket(storage_name)
            .and_then(|bucket| bucket.remove(key))
    }

    /// Read-modify-write on one bucket under its exclusive lock.
    pub fn update<R>(&self, storage_name: &str, f: impl FnOnce(&mut BucketEntries) -> R) -> R {
        self.get_all_data(storage_name).update(f)
    }

    /// Drop an entire bucket. Returns whether it existed.
    pub fn remove_storage(&self, storage_name: &str) -> bool {
        let removed = self
            .buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(storage_name)
            .is_some();
        if removed {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Names of all buckets currently held, sorted.
    pub fn storage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Copy of the full store contents.
    pub fn snapshot(&self) -> Snapshot {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.snapshot()))
            .collect()
    }

    /// Whether there are mutations not yet flushed to the backend.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Flush the current contents to the durable backend.
    ///
    /// Does nothing when no mutation happened since the last successful flush.
    /// On failure the store stays dirty so the next call retries. Concurrent
    /// callers queue on the flush lock, so an older snapshot can never
    /// overwrite a newer one in the backend.
    pub fn synchronize(&self) -> Result<()> {
        let _flush = self.flush.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = self.snapshot();
        if let Err(e) = self.backend.save(&snapshot) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(buckets = snapshot.len(), "Synchronized user data store");
        Ok(())
    }
}
