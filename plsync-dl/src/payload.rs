//! Payload sanity checks and atomic placement
//!
//! A destination file is only ever created by renaming a fully written
//! sibling, so readers never observe a partial download.

use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use crate::strategy::StrategyError;

/// Container formats recognised by their leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSignature {
    Id3,
    MpegFrame,
    Ogg,
    Flac,
    Mp4,
    Wave,
}

/// Identify audio by magic bytes
pub fn sniff_signature(header: &[u8]) -> Option<AudioSignature> {
    if header.len() < 4 {
        return None;
    }

    if header.starts_with(b"ID3") {
        return Some(AudioSignature::Id3);
    }
    // MPEG audio frame sync: 11 set bits
    if header[0] == 0xFF && (header[1] & 0xE0) == 0xE0 {
        return Some(AudioSignature::MpegFrame);
    }
    if header.starts_with(b"OggS") {
        return Some(AudioSignature::Ogg);
    }
    if header.starts_with(b"fLaC") {
        return Some(AudioSignature::Flac);
    }
    if header.len() >= 8 && &header[4..8] == b"ftyp" {
        return Some(AudioSignature::Mp4);
    }
    if header.len() >= 12 && header.starts_with(b"RIFF") && &header[8..12] == b"WAVE" {
        return Some(AudioSignature::Wave);
    }

    None
}

/// Size and type limits for downloaded bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadPolicy {
    /// Anything at or below this is an error page, not audio
    pub min_bytes: u64,
    /// Large enough to accept even with an unhelpful content type
    pub plausible_bytes: u64,
}

impl PayloadPolicy {
    pub fn from_config(config: &plsync_common::config::DownloadConfig) -> Self {
        Self {
            min_bytes: config.min_payload_bytes,
            plausible_bytes: config.plausible_payload_bytes,
        }
    }

    /// Accept a complete in-memory body
    pub fn check(&self, body: &[u8], content_type: Option<&str>) -> Result<(), StrategyError> {
        self.check_parts(body.len() as u64, &body[..body.len().min(16)], content_type)
    }

    /// Accept a body described by its size and leading bytes
    pub fn check_parts(
        &self,
        len: u64,
        header: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), StrategyError> {
        if len <= self.min_bytes {
            return Err(StrategyError::CorruptArtifact(format!(
                "payload too small ({} bytes)",
                len
            )));
        }

        let content_type = content_type.unwrap_or("").to_ascii_lowercase();
        if content_type.starts_with("text/html") || content_type.starts_with("application/json") {
            return Err(StrategyError::CorruptArtifact(format!(
                "unexpected content type {}",
                content_type
            )));
        }

        let typed_audio = content_type.starts_with("audio/")
            || content_type.starts_with("application/octet-stream");
        if typed_audio || sniff_signature(header).is_some() || len > self.plausible_bytes {
            Ok(())
        } else {
            Err(StrategyError::CorruptArtifact(format!(
                "{} bytes of unrecognised content",
                len
            )))
        }
    }

    /// Accept a file already on disk (external tool output)
    pub async fn check_file(&self, path: &Path) -> Result<u64, StrategyError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| StrategyError::CorruptArtifact(format!("{}: {}", path.display(), e)))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| StrategyError::CorruptArtifact(e.to_string()))?
            .len();

        let mut header = [0u8; 16];
        let read = file
            .read(&mut header)
            .await
            .map_err(|e| StrategyError::CorruptArtifact(e.to_string()))?;

        self.check_parts(len, &header[..read], None)?;
        Ok(len)
    }
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        Self::from_config(&plsync_common::config::DownloadConfig::default())
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.part", uuid::Uuid::new_v4().simple()));
    dest.with_file_name(name)
}

/// Write `body` to `dest` via a temporary sibling and rename
pub async fn write_atomic(dest: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp = part_path(dest);
    if let Err(e) = tokio::fs::write(&temp, body).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&temp, dest).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    Ok(())
}

/// Move a finished file into place, copying when rename crosses filesystems
pub async fn move_into_place(source: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }

    let temp = part_path(dest);
    if let Err(e) = tokio::fs::copy(source, &temp).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    tokio::fs::rename(&temp, dest).await?;
    let _ = tokio::fs::remove_file(source).await;
    Ok(())
}
