//! Durable backends the user data store flushes to.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::Snapshot;
use crate::error::{Error, Result};

/// Durable home for [`UserDataStore`](super::UserDataStore) snapshots.
pub trait StorageBackend: Send + Sync {
    /// Load the last saved snapshot. An absent store is an empty snapshot.
    fn load(&self) -> Result<Snapshot>;

    /// Replace the stored snapshot.
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    fn load(&self) -> Result<Snapshot> {
        (**self).load()
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        (**self).save(snapshot)
    }
}

static TEMP_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Keeps the last flushed snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    saved: Mutex<Snapshot>,
    saves: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot passed to the most recent `save`.
    pub fn last_saved(&self) -> Snapshot {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful `save` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self) -> Result<Snapshot> {
        Ok(self.last_saved())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Persists the store as a pretty-printed JSON file.
///
/// Each write goes to its own sibling temporary file that is renamed over the target, so
/// a crash mid-write leaves the previous snapshot intact. The file holds key
/// material and is created owner-only on Unix.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        name.push(format!(".{}.{seq}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

impl StorageBackend for JsonFileBackend {
    fn load(&self) -> Result<Snapshot> {
        if !self.path.exists() {
            return Ok(Snapshot::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&data).map_err(|e| {
            Error::Storage(format!(
                "Failed to parse user data store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
