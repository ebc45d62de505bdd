//! Heuristic integrity checks for downloaded audio
//!
//! Rules are applied in order and the first match decides:
//! 1. no file → missing
//! 2. below the absolute size floor → corrupted
//! 3. below a fraction of the size implied by the expected duration at the
//!    minimum plausible bitrate → corrupted
//! 4. with a duration probe: far too short or far too long → corrupted; outside
//!    tolerance but plausible → valid, logged as a different version
//! 5. without a probe (or when probing the file fails): leading bytes must be
//!    a known audio container
//!
//! When the environment keeps a check from concluding, the file is treated as
//! valid rather than thrown away.

use async_trait::async_trait;
use plsync_common::config::IntegrityConfig;
use plsync_common::models::MAX_DURATION_SECS;
use plsync_common::{paths, PlaylistRecord, TrackDescriptor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::payload::sniff_signature;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe tool not installed")]
    NotInstalled,

    #[error("Probe failed: {0}")]
    Failed(String),

    #[error("Probe timed out")]
    Timeout,

    #[error("Unparseable probe output: {0}")]
    Unparseable(String),
}

/// Reads the playable duration of a file
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Duration in seconds
    async fn probe(&self, path: &Path) -> Result<f64, ProbeError>;
}

/// `ffprobe -v quiet -show_entries format=duration -of csv=p=0 <file>`
pub struct FfprobeProbe {
    program: String,
    timeout: Duration,
    available: OnceCell<bool>,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            available: OnceCell::new(),
        }
    }

    pub fn from_config(config: &IntegrityConfig) -> Self {
        Self::new(
            config.probe_program.clone(),
            Duration::from_secs(config.probe_timeout_secs),
        )
    }

    async fn detect(&self) -> bool {
        let status = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) if status.success() => true,
            _ => {
                info!(program = %self.program, "Duration probe not available, using signature checks");
                false
            }
        }
    }
}

#[async_trait]
impl DurationProbe for FfprobeProbe {
    async fn is_available(&self) -> bool {
        *self.available.get_or_init(|| self.detect()).await
    }

    async fn probe(&self, path: &Path) -> Result<f64, ProbeError> {
        let output = Command::new(&self.program)
            .args(["-v", "quiet", "-show_entries", "format=duration", "-of", "csv=p=0"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProbeError::NotInstalled)
            }
            Ok(Err(e)) => return Err(ProbeError::Failed(e.to_string())),
            Err(_) => return Err(ProbeError::Timeout),
        };

        if !output.status.success() {
            return Err(ProbeError::Failed(format!("exit status {}", output.status)));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let text = text.trim();
        text.parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .ok_or_else(|| ProbeError::Unparseable(text.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrityStatus {
    Valid,
    Corrupted,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityVerdict {
    pub status: IntegrityStatus,
    pub reason: String,
}

impl IntegrityVerdict {
    fn valid(reason: impl Into<String>) -> Self {
        Self {
            status: IntegrityStatus::Valid,
            reason: reason.into(),
        }
    }

    fn corrupted(reason: impl Into<String>) -> Self {
        Self {
            status: IntegrityStatus::Corrupted,
            reason: reason.into(),
        }
    }

    fn missing() -> Self {
        Self {
            status: IntegrityStatus::Missing,
            reason: "file not found".to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == IntegrityStatus::Valid
    }
}

/// Integrity classification of every song in a playlist
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistIntegrityReport {
    pub playlist_id: String,
    pub playlist_name: String,
    pub valid: Vec<TrackDescriptor>,
    pub corrupted: Vec<(TrackDescriptor, String)>,
    pub missing: Vec<TrackDescriptor>,
}

impl PlaylistIntegrityReport {
    pub fn total(&self) -> usize {
        self.valid.len() + self.corrupted.len() + self.missing.len()
    }

    pub fn is_healthy(&self) -> bool {
        self.corrupted.is_empty() && self.missing.is_empty()
    }

    /// Songs that need to be acquired again
    pub fn needs_fix(&self) -> Vec<TrackDescriptor> {
        self.corrupted
            .iter()
            .map(|(track, _)| track.clone())
            .chain(self.missing.iter().cloned())
            .collect()
    }
}

pub struct IntegrityVerifier {
    config: IntegrityConfig,
    probe: Option<Arc<dyn DurationProbe>>,
}

impl IntegrityVerifier {
    pub fn new(config: IntegrityConfig, probe: Option<Arc<dyn DurationProbe>>) -> Self {
        Self { config, probe }
    }

    /// Allowed deviation between expected and probed duration
    pub fn tolerance_secs(&self, expected_secs: f64) -> f64 {
        let c = &self.config;
        let fraction = if expected_secs < c.short_track_secs as f64 {
            c.short_track_tolerance
        } else if expected_secs < c.medium_track_secs as f64 {
            c.medium_track_tolerance
        } else {
            c.long_track_tolerance
        };
        (expected_secs * fraction).max(c.tolerance_floor_secs)
    }

    /// Classify one file against the track's expected duration
    pub async fn verify(&self, path: &Path, expected_secs: Option<u64>) -> IntegrityVerdict {
        let expected_secs = expected_secs.filter(|secs| (1..=MAX_DURATION_SECS).contains(secs));
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => return IntegrityVerdict::missing(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return IntegrityVerdict::missing(),
            Err(e) => {
                warn!("Cannot stat {}: {}", path.display(), e);
                return IntegrityVerdict::valid("inconclusive: metadata unavailable");
            }
        };

        if size < self.config.min_file_bytes {
            return IntegrityVerdict::corrupted(format!(
                "file too small ({} bytes, minimum {})",
                size, self.config.min_file_bytes
            ));
        }

        if let Some(expected) = expected_secs {
            let estimate = expected
                .saturating_mul(self.config.min_bitrate_kbps)
                .saturating_mul(1000)
                / 8;
            let floor = (estimate as f64 * self.config.size_fraction) as u64;
            if size < floor {
                return IntegrityVerdict::corrupted(format!(
                    "file too small for {}s of audio ({} bytes, expected at least {})",
                    expected, size, floor
                ));
            }
        }

        if let Some(probe) = &self.probe {
            if probe.is_available().await {
                match probe.probe(path).await {
                    Ok(probed) => return self.judge_duration(path, probed, expected_secs),
                    Err(e) => {
                        debug!("Duration probe failed for {}: {}", path.display(), e);
                    }
                }
            }
        }

        self.check_signature(path).await
    }

    fn judge_duration(&self, path: &Path, probed: f64, expected_secs: Option<u64>) -> IntegrityVerdict {
        let Some(expected) = expected_secs.map(|e| e as f64) else {
            return IntegrityVerdict::valid(format!("decodable, {:.0}s", probed));
        };

        let ratio = probed / expected;
        if ratio < self.config.truncated_ratio {
            return IntegrityVerdict::corrupted(format!(
                "truncated: {:.0}s of expected {:.0}s",
                probed, expected
            ));
        }
        if ratio > self.config.oversized_ratio {
            return IntegrityVerdict::corrupted(format!(
                "wrong track: {:.0}s for expected {:.0}s",
                probed, expected
            ));
        }

        let difference = (probed - expected).abs();
        if difference > self.tolerance_secs(expected) {
            info!(
                file = %path.display(),
                probed_secs = probed,
                expected_secs = expected,
                "Duration differs, probably a different version of the track"
            );
            return IntegrityVerdict::valid("different version");
        }

        IntegrityVerdict::valid(format!("duration {:.0}s matches", probed))
    }

    async fn check_signature(&self, path: &Path) -> IntegrityVerdict {
        let mut header = [0u8; 16];
        let read = match tokio::fs::File::open(path).await {
            Ok(mut file) => match file.read(&mut header).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Cannot read {}: {}", path.display(), e);
                    return IntegrityVerdict::valid("inconclusive: unreadable header");
                }
            },
            Err(e) => {
                warn!("Cannot open {}: {}", path.display(), e);
                return IntegrityVerdict::valid("inconclusive: cannot open");
            }
        };

        match sniff_signature(&header[..read]) {
            Some(signature) => IntegrityVerdict::valid(format!("{:?} signature", signature)),
            None => IntegrityVerdict::corrupted("no recognised audio signature"),
        }
    }

    /// Classify every song of a playlist by its expected file
    pub async fn verify_playlist(&self, record: &PlaylistRecord, music_dir: &Path) -> PlaylistIntegrityReport {
        let dir = record.storage_dir(music_dir);
        let mut report = PlaylistIntegrityReport {
            playlist_id: record.id.clone(),
            playlist_name: record.name.clone(),
            ..PlaylistIntegrityReport::default()
        };

        for song in &record.songs {
            let path: PathBuf = paths::track_file_path(&dir, song);
            let verdict = self.verify(&path, song.expected_seconds()).await;
            match verdict.status {
                IntegrityStatus::Valid => report.valid.push(song.clone()),
                IntegrityStatus::Missing => report.missing.push(song.clone()),
                IntegrityStatus::Corrupted => {
                    debug!(song = %song.display_name(), reason = %verdict.reason, "Corrupted file");
                    report.corrupted.push((song.clone(), verdict.reason));
                }
            }
        }

        info!(
            playlist = %record.name,
            valid = report.valid.len(),
            corrupted = report.corrupted.len(),
            missing = report.missing.len(),
            "Integrity check complete"
        );
        report
    }
}
