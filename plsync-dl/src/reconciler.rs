//! Remote listing vs. local state
//!
//! A catalog song counts as present only when its identity is in the record
//! AND its expected file exists on disk. Entries whose file vanished are
//! ghosts: they are dropped from the record and, when still listed remotely,
//! come back as new songs.

use plsync_common::{paths, PlaylistRecord, TrackDescriptor};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Result of comparing a remote listing with a catalog record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Catalog songs whose files exist, in catalog order
    pub retained: Vec<TrackDescriptor>,
    /// Catalog songs whose files are gone
    pub ghosts: Vec<TrackDescriptor>,
    /// Remote songs not present locally, in remote order, each identity once
    pub new_songs: Vec<TrackDescriptor>,
}

impl Reconciliation {
    pub fn has_changes(&self) -> bool {
        !self.ghosts.is_empty() || !self.new_songs.is_empty()
    }
}

pub struct PlaylistReconciler {
    music_dir: PathBuf,
}

impl PlaylistReconciler {
    pub fn new(music_dir: impl Into<PathBuf>) -> Self {
        Self {
            music_dir: music_dir.into(),
        }
    }

    pub fn music_dir(&self) -> &Path {
        &self.music_dir
    }

    /// Remote songs that are not present locally
    pub fn diff(&self, remote: &[TrackDescriptor], local: &PlaylistRecord) -> Vec<TrackDescriptor> {
        self.reconcile(remote, local).new_songs
    }

    pub fn reconcile(&self, remote: &[TrackDescriptor], local: &PlaylistRecord) -> Reconciliation {
        let dir = local.storage_dir(&self.music_dir);
        reconcile_with(remote, local, |song| paths::track_file_path(&dir, song).is_file())
    }
}

/// Reconcile using `file_exists` to decide whether a catalog song's file is on disk
pub fn reconcile_with<F>(
    remote: &[TrackDescriptor],
    local: &PlaylistRecord,
    file_exists: F,
) -> Reconciliation
where
    F: Fn(&TrackDescriptor) -> bool,
{
    let (retained, ghosts): (Vec<_>, Vec<_>) =
        local.songs.iter().cloned().partition(|song| file_exists(song));

    let mut present: HashSet<&str> = retained.iter().map(|s| s.url()).collect();
    let mut new_songs = Vec::new();
    for song in remote {
        if present.insert(song.url()) {
            new_songs.push(song.clone());
        }
    }

    Reconciliation {
        retained,
        ghosts,
        new_songs,
    }
}
