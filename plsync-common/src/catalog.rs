//! Durable playlist catalog
//!
//! A JSON document keyed by playlist id. Every write:
//! 1. removes repeated song identities per playlist (first occurrence wins)
//! 2. copies the current file to `<file>.backup`
//! 3. writes the new content, restoring the backup if the write fails
//!
//! A file that cannot be parsed is renamed to `<file>.corrupted` and the store
//! starts empty; user data is never deleted.

use crate::models::PlaylistRecord;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Sibling suffix of the pre-write backup
pub const BACKUP_SUFFIX: &str = "backup";

/// Sibling suffix of a quarantined, unparseable catalog
pub const CORRUPT_SUFFIX: &str = "corrupted";

/// In-memory view of the catalog
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    playlists: BTreeMap<String, PlaylistRecord>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&PlaylistRecord> {
        self.playlists.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PlaylistRecord> {
        self.playlists.get_mut(id)
    }

    /// Insert or replace a record under its own id
    pub fn upsert(&mut self, record: PlaylistRecord) -> Option<PlaylistRecord> {
        self.playlists.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<PlaylistRecord> {
        self.playlists.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.playlists.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaylistRecord> {
        self.playlists.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.playlists.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.playlists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.playlists.is_empty()
    }

    /// Per-playlist dedup pass. Returns total songs removed.
    pub fn dedup_all(&mut self) -> usize {
        let mut removed_total = 0;
        for record in self.playlists.values_mut() {
            let removed = record.dedup_songs();
            if removed > 0 {
                info!(
                    playlist = %record.name,
                    removed,
                    "Removed duplicate songs before saving"
                );
            }
            removed_total += removed;
        }
        removed_total
    }

    /// Parse a persisted catalog document
    pub fn from_json(content: &str) -> Result<Self> {
        let mut playlists: BTreeMap<String, PlaylistRecord> = serde_json::from_str(content)?;
        for (id, record) in playlists.iter_mut() {
            record.id = id.clone();
        }
        Ok(Self { playlists })
    }

    /// Serialize with stable key order
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.playlists)?)
    }
}

/// File-backed catalog with backup-on-write
pub struct CatalogStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, BACKUP_SUFFIX)
    }

    pub fn quarantine_path(&self) -> PathBuf {
        sibling(&self.path, CORRUPT_SUFFIX)
    }

    /// Load the catalog; an unparseable file is quarantined and an empty catalog returned
    pub fn load(&self) -> Result<Catalog> {
        let _guard = self.guard()?;
        self.load_unlocked()
    }

    /// Dedup, back up, and write
    pub fn save(&self, catalog: &Catalog) -> Result<()> {
        let _guard = self.guard()?;
        self.save_unlocked(catalog)
    }

    /// Load-modify-save as one critical section
    pub fn update<F, T>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Catalog) -> T,
    {
        let _guard = self.guard()?;
        let mut catalog = self.load_unlocked()?;
        let result = mutate(&mut catalog);
        self.save_unlocked(&catalog)?;
        Ok(result)
    }

    /// Snapshot of one record
    pub fn get(&self, id: &str) -> Result<Option<PlaylistRecord>> {
        Ok(self.load()?.get(id).cloned())
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| Error::Internal("catalog lock poisoned".to_string()))
    }

    fn load_unlocked(&self) -> Result<Catalog> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Catalog {} not found, starting empty", self.path.display());
                return Ok(Catalog::new());
            }
            Err(e) => return Err(e.into()),
        };

        match self.parse(&content) {
            Ok(catalog) => Ok(catalog),
            Err(Error::CatalogCorrupt { quarantined, reason }) => {
                error!(
                    reason = %reason,
                    quarantined = ?quarantined,
                    "Catalog corrupted, starting with an empty catalog"
                );
                Ok(Catalog::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Parse content; on failure move the file aside and report `CatalogCorrupt`
    fn parse(&self, content: &str) -> Result<Catalog> {
        Catalog::from_json(content).map_err(|parse_err| {
            let target = self.quarantine_path();
            let quarantined = match std::fs::rename(&self.path, &target) {
                Ok(()) => {
                    info!("Corrupted catalog moved to {}", target.display());
                    Some(target)
                }
                Err(e) => {
                    warn!("Failed to quarantine corrupted catalog: {}", e);
                    None
                }
            };
            Error::CatalogCorrupt {
                quarantined,
                reason: parse_err.to_string(),
            }
        })
    }

    fn save_unlocked(&self, catalog: &Catalog) -> Result<()> {
        let mut deduped = catalog.clone();
        deduped.dedup_all();
        let content = deduped.to_json()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        self.write_with_backup(content.as_bytes(), |path, bytes| std::fs::write(path, bytes))?;
        debug!(playlists = deduped.len(), "Catalog saved");
        Ok(())
    }

    /// Copy the primary to the backup, then write; a failed write restores the backup
    fn write_with_backup<W>(&self, content: &[u8], write: W) -> Result<()>
    where
        W: FnOnce(&Path, &[u8]) -> std::io::Result<()>,
    {
        let backup = self.backup_path();
        let has_backup = if self.path.exists() {
            std::fs::copy(&self.path, &backup)?;
            true
        } else {
            false
        };

        if let Err(write_err) = write(&self.path, content) {
            error!("Error saving catalog: {}", write_err);
            if has_backup {
                match std::fs::copy(&backup, &self.path) {
                    Ok(_) => info!("Restored catalog from backup after save error"),
                    Err(e) => error!("Failed to restore catalog backup: {}", e),
                }
            }
            return Err(write_err.into());
        }
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
