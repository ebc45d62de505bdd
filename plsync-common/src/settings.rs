//! Runtime settings persisted next to the catalog
//!
//! Unlike the TOML bootstrap config these change while the tool runs
//! (toggles, strategy priority, last sync time) and are written back.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default acquisition priority, most preferred first
pub const DEFAULT_STRATEGY_ORDER: &[&str] = &["direct-api", "converter", "spotdl", "yt-dlp"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Download songs found during a sync pass instead of only reporting them
    pub auto_download_new: bool,
    /// Enabled acquisition strategy ids in priority order
    pub strategy_order: Vec<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub notify_sync_results: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_download_new: false,
            strategy_order: DEFAULT_STRATEGY_ORDER.iter().map(|s| s.to_string()).collect(),
            last_sync: None,
            notify_sync_results: true,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, writing defaults when the file does not exist yet
    pub fn load(&self) -> Result<Settings> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(settings) => Ok(settings),
                Err(e) => {
                    warn!(
                        "Settings file {} unreadable ({}), using defaults",
                        self.path.display(),
                        e
                    );
                    Ok(Settings::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let defaults = Settings::default();
                self.save(&defaults)?;
                info!("Created default settings at {}", self.path.display());
                Ok(defaults)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically (temp file + rename)
    pub fn save(&self, settings: &Settings) -> Result<()> {
        if settings.strategy_order.iter().any(|id| id.trim().is_empty()) {
            return Err(Error::InvalidInput("strategy ids must not be empty".to_string()));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(settings)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Load, apply, save
    pub fn update<F>(&self, mutate: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = self.load()?;
        mutate(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}
