//! Filesystem layout and filename sanitization
//!
//! Layout: `<music_dir>/<playlist>/<artist> - <title>.mp3`, or `<title>.mp3`
//! when the track has no artist.

use crate::models::TrackDescriptor;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Extension every acquired track is stored with
pub const AUDIO_EXTENSION: &str = "mp3";

const FORBIDDEN: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Strip path-unsafe characters and collapse whitespace, keeping non-ASCII text
pub fn sanitize_filename(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !FORBIDDEN.contains(c) && !c.is_control())
        .collect();

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    // "." and ".." would resolve to directories
    if collapsed.is_empty() || collapsed.chars().all(|c| c == '.') {
        "Unknown".to_string()
    } else {
        collapsed
    }
}

/// File name a track is stored under
pub fn track_file_name(track: &TrackDescriptor) -> String {
    let title = sanitize_filename(track.title());
    if track.artist().trim().is_empty() {
        format!("{}.{}", title, AUDIO_EXTENSION)
    } else {
        format!(
            "{} - {}.{}",
            sanitize_filename(track.artist()),
            title,
            AUDIO_EXTENSION
        )
    }
}

/// Expected location of a track inside a playlist directory
pub fn track_file_path(playlist_dir: &Path, track: &TrackDescriptor) -> PathBuf {
    playlist_dir.join(track_file_name(track))
}

/// Directory for a playlist under the music root
pub fn playlist_dir(music_dir: &Path, playlist_name: &str) -> PathBuf {
    music_dir.join(sanitize_filename(playlist_name))
}

/// Directory for a new playlist that none of `taken` already uses.
/// Collisions get a " (2)", " (3)", ... suffix; comparison ignores case.
pub fn unused_playlist_dir(music_dir: &Path, playlist_name: &str, taken: &[PathBuf]) -> PathBuf {
    let taken: Vec<String> = taken.iter().map(|p| dir_key(p)).collect();
    let mut dir = playlist_dir(music_dir, playlist_name);
    let mut n = 2;
    while taken.contains(&dir_key(&dir)) {
        dir = playlist_dir(music_dir, &format!("{} ({})", playlist_name, n));
        n += 1;
    }
    dir
}

fn dir_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// Ensure `path` resolves inside `root` (guards recursive deletes)
pub fn validate_within(path: &Path, root: &Path) -> Result<()> {
    let canonical_path = path
        .canonicalize()
        .map_err(|e| Error::InvalidInput(format!("{}: {}", path.display(), e)))?;
    let canonical_root = root
        .canonicalize()
        .map_err(|e| Error::InvalidInput(format!("{}: {}", root.display(), e)))?;

    if canonical_path == canonical_root || !canonical_path.starts_with(&canonical_root) {
        return Err(Error::InvalidInput(format!(
            "{} is outside of {}",
            path.display(),
            root.display()
        )));
    }

    Ok(())
}
