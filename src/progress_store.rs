//! # Progress Store
//!
//! Durable home of the [`Progress`] state: factory checkpoints, deployment caches and entity
//! records.
//!
//! ## Overview
//!
//! - Every save writes the complete state. The file backend writes to a temporary file in the
//!   target directory, syncs it and renames it over the previous file, so a crash leaves either
//!   the old or the new state on disk and never a torn write.
//! - A save that would move any checkpoint backwards is refused with
//!   [`SyncError::CheckpointRegression`]. The only way to move a checkpoint back is an explicit
//!   [`ProgressStore::reset`] or [`ProgressStore::reset_entity`].
//! - Missing or unreadable state is not an error: the store logs a warning and starts fresh.

use ethers::types::Address;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::SyncError;
use crate::types::entity::EntityRecord;
use crate::types::progress::{Checkpoint, Progress, PROGRESS_FORMAT_VERSION};

/// Byte storage addressed by key.
pub trait StorageBackend: Send + Sync {
    /// `Ok(None)` when nothing is stored under `key`.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError>;
    /// Replaces the bytes stored under `key`.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), SyncError>;
}

/// Keys are file paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBackend;

impl StorageBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        match fs::read(key) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Persistence(format!("read {}: {}", key, e))),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), SyncError> {
        let path = Path::new(key);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| SyncError::Persistence(format!("create {}: {}", dir.display(), e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| SyncError::Persistence(format!("temp file in {}: {}", dir.display(), e)))?;
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| SyncError::Persistence(format!("write {}: {}", key, e)))?;
        tmp.persist(path)
            .map_err(|e| SyncError::Persistence(format!("replace {}: {}", key, e.error)))?;
        Ok(())
    }
}

/// In-memory backend. Writes can be made to fail to exercise persistence errors.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), bytes);
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Persistence("memory backend poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Persistence(format!("injected write failure for {}", key)));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Persistence("memory backend poisoned".to_string()))?;
        entries.insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ProgressStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
    /// Checkpoint of the last state loaded or written.
    committed: Checkpoint,
}

impl ProgressStore {
    pub fn new(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            committed: Checkpoint::default(),
        }
    }

    pub fn open_file(path: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(FileBackend), path.as_ref().to_string_lossy().into_owned())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn committed(&self) -> &Checkpoint {
        &self.committed
    }

    /// Loads the stored state, or a fresh one when nothing usable is stored.
    pub fn load(&mut self) -> Progress {
        let progress = match self.backend.read(&self.key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Progress>(&bytes) {
                Ok(progress) if progress.version == PROGRESS_FORMAT_VERSION => {
                    info!(
                        "📂 Loaded progress from {}: {} sources, {} entities",
                        self.key,
                        progress.sources.len(),
                        progress.entities.len()
                    );
                    progress
                }
                Ok(progress) => {
                    warn!(
                        "⚠️ Progress at {} has format version {} (expected {}), starting fresh",
                        self.key, progress.version, PROGRESS_FORMAT_VERSION
                    );
                    Progress::default()
                }
                Err(e) => {
                    warn!("⚠️ Progress at {} is corrupt ({}), starting fresh", self.key, e);
                    Progress::default()
                }
            },
            Ok(None) => {
                info!("No progress at {}, starting fresh", self.key);
                Progress::default()
            }
            Err(e) => {
                warn!("⚠️ Could not read progress at {} ({}), starting fresh", self.key, e);
                Progress::default()
            }
        };
        self.committed = progress.checkpoint();
        progress
    }

    /// Writes the complete state. Refuses to move any checkpoint backwards.
    pub fn save(&mut self, progress: &Progress) -> Result<(), SyncError> {
        let checkpoint = progress.checkpoint();
        if let Some(regression) = checkpoint.regression_from(&self.committed) {
            return Err(SyncError::CheckpointRegression {
                key: regression.key,
                committed: regression.committed,
                attempted: regression.attempted,
            });
        }
        self.write(progress)?;
        self.committed = checkpoint;
        Ok(())
    }

    /// Replaces the stored state with an empty one.
    pub fn reset(&mut self) -> Result<Progress, SyncError> {
        let progress = Progress::default();
        self.write(&progress)?;
        self.committed = Checkpoint::default();
        info!("🧹 Progress at {} reset", self.key);
        Ok(progress)
    }

    /// Forgets one entity so its next pass starts again from its deployment block.
    pub fn reset_entity(
        &mut self,
        progress: &mut Progress,
        address: &Address,
    ) -> Result<Option<EntityRecord>, SyncError> {
        let removed = progress.reset_entity(address);
        if removed.is_some() {
            self.committed.entities.remove(address);
            self.save(progress)?;
            info!("🧹 Entity {:?} reset", address);
        }
        Ok(removed)
    }

    fn write(&self, progress: &Progress) -> Result<(), SyncError> {
        let bytes = serde_json::to_vec_pretty(progress)?;
        self.backend.write(&self.key, &bytes)?;
        debug!("💾 Saved progress to {} ({} bytes)", self.key, bytes.len());
        Ok(())
    }
}
