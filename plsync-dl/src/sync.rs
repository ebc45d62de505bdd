//! Playlist-level operations
//!
//! [`SyncManager`] ties the listing, reconciler, orchestrator and verifier to
//! the catalog. Every operation on a playlist holds that playlist's lock, so a
//! scheduled sync and an interactive command never interleave on the same
//! playlist. Tracks are processed one at a time and each verified download is
//! written to the catalog immediately.

use chrono::Utc;
use plsync_common::models::playlist_id_from_url;
use plsync_common::{paths, CatalogStore, PlaylistRecord, SettingsStore, TrackDescriptor};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::integrity::{IntegrityVerifier, PlaylistIntegrityReport};
use crate::listing::{RemoteListing, RemotePlaylist};
use crate::orchestrator::{DownloadOrchestrator, DownloadOutcome};
use crate::reconciler::PlaylistReconciler;

/// A track that could not be acquired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTrack {
    pub name: String,
    pub reasons: Vec<String>,
}

/// Outcome of downloading a batch of tracks into one playlist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub downloaded: Vec<String>,
    /// Files already on disk and valid, adopted without a download
    pub adopted: Vec<String>,
    pub failed: Vec<FailedTrack>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.downloaded.len() + self.adopted.len()
    }
}

/// Outcome of reconciling one playlist with its remote listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSyncReport {
    pub playlist_id: String,
    pub playlist_name: String,
    pub new_songs: Vec<TrackDescriptor>,
    /// Catalog entries dropped because their file vanished
    pub ghosts_pruned: usize,
    /// Present when new songs were downloaded
    pub batch: Option<BatchReport>,
}

/// Outcome of a sync pass over every linked playlist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub playlists: Vec<PlaylistSyncReport>,
    pub errors: Vec<(String, String)>,
    pub cancelled: bool,
}

impl SyncSummary {
    pub fn new_song_count(&self) -> usize {
        self.playlists.iter().map(|p| p.new_songs.len()).sum()
    }
}

/// Outcome of repairing a playlist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixReport {
    pub deleted_corrupted: usize,
    pub fixed: Vec<String>,
    /// Songs dropped from the record after re-acquisition failed
    pub removed: Vec<String>,
    pub cancelled: bool,
}

/// A newly linked playlist together with the listing it was linked from
#[derive(Debug, Clone)]
pub struct LinkedPlaylist {
    pub record: PlaylistRecord,
    pub remote: RemotePlaylist,
    pub batch: Option<BatchReport>,
}

pub struct SyncManager {
    catalog: Arc<CatalogStore>,
    settings: Arc<SettingsStore>,
    listing: Arc<dyn RemoteListing>,
    orchestrator: Arc<DownloadOrchestrator>,
    verifier: Arc<IntegrityVerifier>,
    reconciler: PlaylistReconciler,
    music_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Held from choosing a new playlist's directory until its record is saved
    allocating: AsyncMutex<()>,
}

impl SyncManager {
    pub fn new(
        catalog: Arc<CatalogStore>,
        settings: Arc<SettingsStore>,
        listing: Arc<dyn RemoteListing>,
        orchestrator: Arc<DownloadOrchestrator>,
        verifier: Arc<IntegrityVerifier>,
        music_dir: PathBuf,
    ) -> Self {
        Self {
            catalog,
            settings,
            listing,
            orchestrator,
            verifier,
            reconciler: PlaylistReconciler::new(music_dir.clone()),
            music_dir,
            locks: Mutex::new(HashMap::new()),
            allocating: AsyncMutex::new(()),
        }
    }

    pub fn music_dir(&self) -> &Path {
        &self.music_dir
    }

    /// Exclusive access to one playlist; a second caller waits
    async fn lock_playlist(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn record(&self, id: &str) -> Result<PlaylistRecord> {
        self.catalog
            .get(id)?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    /// Directory for a new playlist, distinct from every recorded one
    fn allocate_dir(&self, name: &str) -> Result<PathBuf> {
        let taken: Vec<PathBuf> = self
            .catalog
            .load()?
            .iter()
            .map(|r| r.storage_dir(&self.music_dir))
            .collect();
        Ok(paths::unused_playlist_dir(&self.music_dir, name, &taken))
    }

    pub fn list_playlists(&self) -> Result<Vec<PlaylistRecord>> {
        Ok(self.catalog.load()?.iter().cloned().collect())
    }

    pub fn playlist(&self, id: &str) -> Result<PlaylistRecord> {
        self.record(id)
    }

    /// Link a remote playlist, optionally downloading every song right away
    pub async fn link_playlist(
        &self,
        url: &str,
        name: Option<String>,
        download: bool,
        cancel: &CancellationToken,
    ) -> Result<LinkedPlaylist> {
        let id = playlist_id_from_url(url)
            .ok_or_else(|| SyncError::InvalidInput(format!("cannot derive playlist id from {}", url)))?;
        let _guard = self.lock_playlist(&id).await;

        if self.catalog.get(&id)?.is_some() {
            return Err(SyncError::AlreadyExists(id));
        }

        let remote = self.listing.fetch(url, cancel).await?;
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| remote.suggested_name());

        let record = {
            let _allocating = self.allocating.lock().await;
            let dir = self.allocate_dir(&name)?;
            tokio::fs::create_dir_all(&dir).await?;
            let record = PlaylistRecord::linked(id.clone(), name, url, dir);
            self.catalog.update(|catalog| catalog.upsert(record.clone()))?;
            record
        };
        info!(playlist = %record.name, id = %id, songs = remote.songs.len(), "Playlist linked");

        let batch = if download {
            Some(self.download_songs(&record, &remote.songs, cancel).await?)
        } else {
            None
        };

        let record = self.record(&id)?;
        Ok(LinkedPlaylist { record, remote, batch })
    }

    /// Create an empty playlist with no remote listing
    pub async fn create_custom(&self, name: &str) -> Result<PlaylistRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidInput("playlist name must not be empty".to_string()));
        }

        let _allocating = self.allocating.lock().await;
        let dir = self.allocate_dir(name)?;
        tokio::fs::create_dir_all(&dir).await?;

        let record = PlaylistRecord::custom(name, dir);
        self.catalog.update(|catalog| catalog.upsert(record.clone()))?;
        info!(playlist = %record.name, id = %record.id, "Custom playlist created");
        Ok(record)
    }

    /// Acquire one track into a playlist and append it once verified
    pub async fn add_track(
        &self,
        id: &str,
        track: TrackDescriptor,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let _guard = self.lock_playlist(id).await;
        let record = self.record(id)?;
        if record.contains(track.url()) {
            return Err(SyncError::InvalidInput(format!(
                "{} is already in {}",
                track.display_name(),
                record.name
            )));
        }
        self.download_songs(&record, std::slice::from_ref(&track), cancel).await
    }

    /// Download the given songs (normally the new songs of a reconciliation)
    pub async fn download_new(
        &self,
        id: &str,
        songs: &[TrackDescriptor],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let _guard = self.lock_playlist(id).await;
        let record = self.record(id)?;
        self.download_songs(&record, songs, cancel).await
    }

    /// Reconcile one linked playlist and, when asked, download what is new
    pub async fn update_playlist(
        &self,
        id: &str,
        download: bool,
        cancel: &CancellationToken,
    ) -> Result<PlaylistSyncReport> {
        let _guard = self.lock_playlist(id).await;
        self.update_locked(id, download, cancel).await
    }

    async fn update_locked(
        &self,
        id: &str,
        download: bool,
        cancel: &CancellationToken,
    ) -> Result<PlaylistSyncReport> {
        let record = self.record(id)?;
        let url = match (&record.url, record.is_custom) {
            (Some(url), false) => url.clone(),
            _ => {
                return Err(SyncError::InvalidInput(format!(
                    "{} has no remote listing",
                    record.name
                )))
            }
        };

        let remote = self.listing.fetch(&url, cancel).await?;
        let reconciliation = self.reconciler.reconcile(&remote.songs, &record);

        let ghosts_pruned = reconciliation.ghosts.len();
        if ghosts_pruned > 0 {
            let retained = reconciliation.retained.clone();
            self.catalog.update(|catalog| {
                if let Some(r) = catalog.get_mut(id) {
                    r.songs = retained;
                }
            })?;
            info!(playlist = %record.name, ghosts_pruned, "Dropped catalog entries without files");
        }

        if reconciliation.new_songs.is_empty() {
            debug!(playlist = %record.name, "Playlist up to date");
        } else {
            info!(
                playlist = %record.name,
                new_songs = reconciliation.new_songs.len(),
                "New songs found"
            );
        }

        let batch = if download && !reconciliation.new_songs.is_empty() {
            let record = self.record(id)?;
            Some(self.download_songs(&record, &reconciliation.new_songs, cancel).await?)
        } else {
            None
        };

        Ok(PlaylistSyncReport {
            playlist_id: record.id,
            playlist_name: record.name,
            new_songs: reconciliation.new_songs,
            ghosts_pruned,
            batch,
        })
    }

    /// Reconcile every linked playlist. Failures are collected, not raised.
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<SyncSummary> {
        let settings = self.settings.load()?;
        let ids: Vec<String> = self
            .catalog
            .load()?
            .iter()
            .filter(|r| !r.is_custom && r.url.is_some())
            .map(|r| r.id.clone())
            .collect();

        info!(
            playlists = ids.len(),
            auto_download = settings.auto_download_new,
            "Starting sync"
        );

        let mut summary = SyncSummary::default();
        for id in ids {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            match self.update_playlist(&id, settings.auto_download_new, cancel).await {
                Ok(report) => {
                    if report.batch.as_ref().map_or(false, |b| b.cancelled) {
                        summary.cancelled = true;
                    }
                    summary.playlists.push(report);
                }
                Err(SyncError::Cancelled) | Err(SyncError::Listing(crate::listing::ListingError::Cancelled)) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(playlist = %id, "Sync failed: {}", e);
                    summary.errors.push((id, e.to_string()));
                }
            }
        }

        if !summary.cancelled {
            self.settings.update(|s| s.last_sync = Some(Utc::now()))?;
        }

        info!(
            new_songs = summary.new_song_count(),
            errors = summary.errors.len(),
            "Sync finished"
        );
        Ok(summary)
    }

    pub async fn check_integrity(&self, id: &str) -> Result<PlaylistIntegrityReport> {
        let _guard = self.lock_playlist(id).await;
        let record = self.record(id)?;
        Ok(self.verifier.verify_playlist(&record, &self.music_dir).await)
    }

    pub async fn check_all(&self) -> Result<Vec<PlaylistIntegrityReport>> {
        let ids = self.catalog.load()?.ids();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            reports.push(self.check_integrity(&id).await?);
        }
        Ok(reports)
    }

    /// Delete corrupted files and re-acquire everything broken or missing
    pub async fn fix_playlist(&self, id: &str, cancel: &CancellationToken) -> Result<FixReport> {
        let _guard = self.lock_playlist(id).await;
        let record = self.record(id)?;
        let dir = record.storage_dir(&self.music_dir);
        let report = self.verifier.verify_playlist(&record, &self.music_dir).await;

        let mut fix = FixReport::default();
        if report.is_healthy() {
            return Ok(fix);
        }

        for (song, reason) in &report.corrupted {
            let path = paths::track_file_path(&dir, song);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(song = %song.display_name(), reason = %reason, "Deleted corrupted file");
                    fix.deleted_corrupted += 1;
                }
                Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
            }
        }

        let order = self.settings.load()?.strategy_order;
        let mut failed_urls = Vec::new();
        for song in report.needs_fix() {
            if cancel.is_cancelled() {
                fix.cancelled = true;
                break;
            }

            let dest = paths::track_file_path(&dir, &song);
            match self.acquire_verified(&song, &dest, &order, cancel).await {
                Acquired::Ok => fix.fixed.push(song.display_name()),
                Acquired::Cancelled => {
                    fix.cancelled = true;
                    break;
                }
                Acquired::Failed(_) => {
                    fix.removed.push(song.display_name());
                    failed_urls.push(song.url().to_string());
                }
            }
        }

        if !failed_urls.is_empty() {
            self.catalog.update(|catalog| {
                if let Some(r) = catalog.get_mut(id) {
                    r.songs.retain(|s| !failed_urls.iter().any(|u| u == s.url()));
                }
            })?;
        }

        info!(
            playlist = %record.name,
            fixed = fix.fixed.len(),
            removed = fix.removed.len(),
            "Playlist repair finished"
        );
        Ok(fix)
    }

    /// Remove a playlist record and its files
    pub async fn delete_playlist(&self, id: &str) -> Result<PlaylistRecord> {
        let _guard = self.lock_playlist(id).await;
        let catalog = self.catalog.load()?;
        let record = catalog
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let dir = record.storage_dir(&self.music_dir);
        let sharing: Vec<&PlaylistRecord> = catalog
            .iter()
            .filter(|r| r.id != record.id && r.storage_dir(&self.music_dir) == dir)
            .collect();

        if !dir.exists() {
            debug!(playlist = %record.name, "No files to delete");
        } else if sharing.is_empty() {
            paths::validate_within(&dir, &self.music_dir)?;
            tokio::fs::remove_dir_all(&dir).await?;
            info!(playlist = %record.name, "Deleted playlist files");
        } else {
            // Older catalogs may point two records at one directory
            let shared_dir: &Path = &dir;
            let in_use: HashSet<PathBuf> = sharing
                .iter()
                .flat_map(|r| r.songs.iter().map(move |s| paths::track_file_path(shared_dir, s)))
                .collect();
            for song in &record.songs {
                let file = paths::track_file_path(&dir, song);
                if in_use.contains(&file) {
                    continue;
                }
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            warn!(
                playlist = %record.name,
                shared_with = sharing.len(),
                "Directory is shared with other playlists; deleted only this playlist's files"
            );
        }

        self.catalog.update(|catalog| catalog.remove(id))?;
        info!(playlist = %record.name, id = %id, "Playlist deleted");
        Ok(record)
    }

    /// Remove one song (by position) and its file
    pub async fn delete_song(&self, id: &str, index: usize) -> Result<TrackDescriptor> {
        let _guard = self.lock_playlist(id).await;
        let record = self.record(id)?;
        if index >= record.songs.len() {
            return Err(SyncError::InvalidInput(format!(
                "song index {} out of range ({} songs)",
                index,
                record.songs.len()
            )));
        }

        let removed = self
            .catalog
            .update(|catalog| catalog.get_mut(id).and_then(|r| r.remove_song(index)))?
            .ok_or_else(|| SyncError::NotFound(format!("{}#{}", id, index)))?;

        let path = paths::track_file_path(&record.storage_dir(&self.music_dir), &removed);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }

        info!(playlist = %record.name, song = %removed.display_name(), "Song deleted");
        Ok(removed)
    }

    async fn download_songs(
        &self,
        record: &PlaylistRecord,
        songs: &[TrackDescriptor],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let dir = record.storage_dir(&self.music_dir);
        tokio::fs::create_dir_all(&dir).await?;
        let order = self.settings.load()?.strategy_order;

        let mut report = BatchReport::default();
        for (i, song) in songs.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(playlist = %record.name, remaining = songs.len() - i, "Download cancelled");
                report.cancelled = true;
                break;
            }

            debug!(
                playlist = %record.name,
                progress = format!("{}/{}", i + 1, songs.len()),
                song = %song.display_name(),
                "Processing song"
            );

            let dest = paths::track_file_path(&dir, song);
            let adopted = self
                .verifier
                .verify(&dest, song.expected_seconds())
                .await
                .is_valid();

            let acquired = if adopted {
                Acquired::Ok
            } else {
                self.acquire_verified(song, &dest, &order, cancel).await
            };

            match acquired {
                Acquired::Ok => {
                    let track = song.clone();
                    let id = record.id.clone();
                    self.catalog.update(|catalog| {
                        if let Some(r) = catalog.get_mut(&id) {
                            r.append_verified(track);
                        }
                    })?;
                    if adopted {
                        report.adopted.push(song.display_name());
                    } else {
                        report.downloaded.push(song.display_name());
                    }
                }
                Acquired::Failed(reasons) => {
                    report.failed.push(FailedTrack {
                        name: song.display_name(),
                        reasons,
                    });
                }
                Acquired::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }
        }

        info!(
            playlist = %record.name,
            downloaded = report.downloaded.len(),
            adopted = report.adopted.len(),
            failed = report.failed.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Run the orchestrator and accept the file only if it verifies
    async fn acquire_verified(
        &self,
        song: &TrackDescriptor,
        dest: &Path,
        order: &[String],
        cancel: &CancellationToken,
    ) -> Acquired {
        match self.orchestrator.download(song, dest, order, cancel).await {
            DownloadOutcome::Downloaded { .. } => {
                let verdict = self.verifier.verify(dest, song.expected_seconds()).await;
                if verdict.is_valid() {
                    Acquired::Ok
                } else {
                    error!(
                        song = %song.display_name(),
                        reason = %verdict.reason,
                        "Downloaded file failed integrity check"
                    );
                    if let Err(e) = tokio::fs::remove_file(dest).await {
                        warn!("Failed to delete {}: {}", dest.display(), e);
                    }
                    Acquired::Failed(vec![format!("integrity check: {}", verdict.reason)])
                }
            }
            DownloadOutcome::Failed { failures } => Acquired::Failed(
                failures
                    .into_iter()
                    .map(|f| format!("{}: {}", f.strategy, f.reason))
                    .collect(),
            ),
            DownloadOutcome::Cancelled => Acquired::Cancelled,
        }
    }
}

enum Acquired {
    Ok,
    Failed(Vec<String>),
    Cancelled,
}
