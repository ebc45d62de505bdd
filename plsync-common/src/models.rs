//! Track and playlist models
//!
//! Upstream listings are loosely typed: durations arrive as milliseconds, seconds
//! or "M:SS" strings, and scalar fields may be numbers. Everything is normalized
//! exactly once, when a [`RawTrack`] becomes a [`TrackDescriptor`]. Descriptors
//! are immutable after that point.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Integers above this are treated as milliseconds, at or below as seconds
const MILLIS_THRESHOLD: u64 = 10_000;

/// Longest duration accepted from upstream; anything above is treated as unknown
pub const MAX_DURATION_SECS: u64 = 24 * 3600;

/// Fallback duration for tracks whose length is unknown
pub const UNKNOWN_DURATION: &str = "0:00";

/// Upstream family a URL belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Spotify,
    Youtube,
    #[default]
    Other,
}

impl SourceKind {
    /// Classify a URL by host
    pub fn from_url(url: &str) -> Self {
        let host = url
            .split("://")
            .nth(1)
            .unwrap_or(url)
            .split(['/', '?', '#'])
            .next()
            .unwrap_or("")
            .to_lowercase();

        if host == "open.spotify.com" || host.ends_with(".spotify.com") {
            SourceKind::Spotify
        } else if host == "youtu.be"
            || host == "youtube.com"
            || host.ends_with(".youtube.com")
        {
            SourceKind::Youtube
        } else {
            SourceKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Spotify => "spotify",
            SourceKind::Youtube => "youtube",
            SourceKind::Other => "other",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Song entry exactly as an upstream listing (or an older catalog) delivers it
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTrack {
    #[serde(default)]
    pub title: Option<Value>,
    #[serde(default)]
    pub name: Option<Value>,
    #[serde(default)]
    pub artist: Option<Value>,
    #[serde(default)]
    pub artists: Option<Value>,
    #[serde(default)]
    pub url: Option<Value>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub duration_ms: Option<Value>,
    #[serde(default)]
    pub album: Option<Value>,
    #[serde(default)]
    pub thumbnail: Option<Value>,
}

/// A logically identified track; `url` is its identity within a playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTrack")]
pub struct TrackDescriptor {
    title: String,
    artist: String,
    url: String,
    duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<String>,
    source_kind: SourceKind,
}

impl TrackDescriptor {
    /// Build a descriptor from already-typed values
    pub fn new(
        title: impl Into<String>,
        artist: impl Into<String>,
        url: impl Into<String>,
        duration_secs: Option<u64>,
    ) -> Result<Self> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            return Err(Error::InvalidInput("track URL must not be empty".to_string()));
        }

        let title = title.into().trim().to_string();
        Ok(Self {
            title: if title.is_empty() { "Unknown".to_string() } else { title },
            artist: artist.into().trim().to_string(),
            source_kind: SourceKind::from_url(&url),
            url,
            duration: duration_secs
                .filter(|secs| *secs <= MAX_DURATION_SECS)
                .map(format_duration)
                .unwrap_or_else(|| UNKNOWN_DURATION.to_string()),
            album: None,
            thumbnail: None,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Empty when the source has no artist concept
    pub fn artist(&self) -> &str {
        &self.artist
    }

    /// Identity of the track
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Expected duration as "M:SS"
    pub fn duration(&self) -> &str {
        &self.duration
    }

    pub fn album(&self) -> Option<&str> {
        self.album.as_deref()
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    /// Expected duration in seconds, `None` when unknown
    pub fn expected_seconds(&self) -> Option<u64> {
        parse_duration(&self.duration).filter(|secs| *secs > 0)
    }

    /// Human readable "Artist - Title" (or just the title)
    pub fn display_name(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }

    /// Search query used by search-based acquisition methods
    pub fn search_query(&self) -> String {
        self.display_name()
    }
}

impl TryFrom<RawTrack> for TrackDescriptor {
    type Error = Error;

    fn try_from(raw: RawTrack) -> Result<Self> {
        let url = raw
            .url
            .as_ref()
            .and_then(scalar_to_string)
            .unwrap_or_default();
        if url.is_empty() {
            return Err(Error::InvalidInput("track has no URL".to_string()));
        }

        let title = raw
            .title
            .as_ref()
            .or(raw.name.as_ref())
            .and_then(scalar_to_string)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        let artist = raw
            .artist
            .as_ref()
            .and_then(scalar_to_string)
            .or_else(|| raw.artists.as_ref().and_then(join_artists))
            .unwrap_or_default();

        let duration = raw
            .duration
            .as_ref()
            .and_then(normalize_duration)
            .or_else(|| {
                raw.duration_ms
                    .as_ref()
                    .and_then(Value::as_u64)
                    .map(|ms| ms / 1000)
                    .filter(|secs| *secs <= MAX_DURATION_SECS)
                    .map(format_duration)
            })
            .unwrap_or_else(|| UNKNOWN_DURATION.to_string());

        Ok(Self {
            title,
            artist,
            source_kind: SourceKind::from_url(&url),
            url,
            duration,
            album: raw.album.as_ref().and_then(scalar_to_string).filter(|a| !a.is_empty()),
            thumbnail: raw
                .thumbnail
                .as_ref()
                .and_then(scalar_to_string)
                .filter(|t| !t.is_empty()),
        })
    }
}

/// Ingest a raw JSON song list, dropping entries without identity
pub fn ingest_tracks(raw: Vec<RawTrack>) -> Vec<TrackDescriptor> {
    raw.into_iter()
        .filter_map(|entry| match TrackDescriptor::try_from(entry) {
            Ok(track) => Some(track),
            Err(e) => {
                tracing::debug!("Dropping song at ingestion: {}", e);
                None
            }
        })
        .collect()
}

fn deserialize_songs<'de, D>(deserializer: D) -> std::result::Result<Vec<TrackDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<RawTrack>::deserialize(deserializer)?;
    Ok(ingest_tracks(raw))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn join_artists(value: &Value) -> Option<String> {
    let names: Vec<String> = value
        .as_array()?
        .iter()
        .filter_map(|artist| match artist {
            Value::Object(map) => map.get("name").and_then(scalar_to_string),
            other => scalar_to_string(other),
        })
        .filter(|name| !name.is_empty())
        .collect();

    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// Normalize any upstream duration representation to "M:SS"
pub fn normalize_duration(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => parse_duration(s).map(format_duration),
        Value::Number(n) => {
            let secs = match n.as_u64() {
                Some(int) if int > MILLIS_THRESHOLD => int / 1000,
                Some(int) => int,
                None => seconds_from_float(n.as_f64()?)?,
            };
            (secs <= MAX_DURATION_SECS).then(|| format_duration(secs))
        }
        _ => None,
    }
}

/// Parse "M:SS", "H:MM:SS" or a bare number of seconds
pub fn parse_duration(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let parts: Vec<&str> = text.split(':').collect();
    let total = match parts.as_slice() {
        [secs] => seconds_from_float(secs.parse::<f64>().ok()?)?,
        [mins, secs] => {
            let mins: u64 = mins.trim().parse().ok()?;
            let secs: u64 = secs.trim().parse().ok()?;
            mins.checked_mul(60)?.checked_add(secs)?
        }
        [hours, mins, secs] => {
            let hours: u64 = hours.trim().parse().ok()?;
            let mins: u64 = mins.trim().parse().ok()?;
            let secs: u64 = secs.trim().parse().ok()?;
            hours
                .checked_mul(3600)?
                .checked_add(mins.checked_mul(60)?)?
                .checked_add(secs)?
        }
        _ => return None,
    };
    (total <= MAX_DURATION_SECS).then_some(total)
}

fn seconds_from_float(secs: f64) -> Option<u64> {
    let secs = secs.round();
    (secs.is_finite() && (0.0..=MAX_DURATION_SECS as f64).contains(&secs)).then_some(secs as u64)
}

/// Format seconds as "M:SS" (minutes are not wrapped into hours)
pub fn format_duration(total_secs: u64) -> String {
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

/// Persisted playlist record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistRecord {
    /// Catalog key; not repeated inside the persisted value
    #[serde(skip)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_songs")]
    pub songs: Vec<TrackDescriptor>,
    /// Directory holding the playlist's audio files
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default)]
    pub source_kind: SourceKind,
}

impl PlaylistRecord {
    /// Record for a playlist linked to a remote listing
    pub fn linked(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        path: PathBuf,
    ) -> Self {
        let url = url.into();
        Self {
            id: id.into(),
            name: name.into(),
            source_kind: SourceKind::from_url(&url),
            url: Some(url),
            songs: Vec::new(),
            path,
            is_custom: false,
        }
    }

    /// Manually created playlist with no remote listing
    pub fn custom(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            id: format!("custom-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            url: None,
            songs: Vec::new(),
            path,
            is_custom: true,
            source_kind: SourceKind::Other,
        }
    }

    /// Storage directory, falling back to the standard layout for records without one
    pub fn storage_dir(&self, music_dir: &Path) -> PathBuf {
        if self.path.as_os_str().is_empty() {
            crate::paths::playlist_dir(music_dir, &self.name)
        } else {
            self.path.clone()
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.songs.iter().any(|s| s.url() == url)
    }

    /// Append a verified track unless its identity is already present
    pub fn append_verified(&mut self, track: TrackDescriptor) -> bool {
        if self.contains(track.url()) {
            return false;
        }
        self.songs.push(track);
        true
    }

    pub fn remove_song(&mut self, index: usize) -> Option<TrackDescriptor> {
        if index < self.songs.len() {
            Some(self.songs.remove(index))
        } else {
            None
        }
    }

    /// Drop repeated identities, first occurrence wins. Returns how many were removed.
    pub fn dedup_songs(&mut self) -> usize {
        let before = self.songs.len();
        let mut seen = HashSet::new();
        self.songs.retain(|song| seen.insert(song.url().to_string()));
        before - self.songs.len()
    }
}

/// Derive a playlist id from its source URL (last path segment, query stripped)
pub fn playlist_id_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or("");
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
}
