//! Configuration loading and root folder resolution
//!
//! Config file priority:
//! 1. Command-line argument
//! 2. `PLSYNC_CONFIG` environment variable
//! 3. `<config_dir>/plsync/config.toml`
//! 4. Compiled defaults (a missing file is not an error)
//!
//! Root folder priority: command-line argument, `PLSYNC_ROOT_FOLDER`,
//! TOML `root_folder`, OS-dependent default.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "PLSYNC_CONFIG";
pub const ROOT_FOLDER_ENV: &str = "PLSYNC_ROOT_FOLDER";

/// Catalog file name inside the root folder
pub const CATALOG_FILE: &str = "playlist_db.json";
/// Settings file name inside the root folder
pub const SETTINGS_FILE: &str = "settings.json";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    /// Where playlist directories live; defaults to `<root>/music`
    pub music_dir: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub download: DownloadConfig,
    pub governor: GovernorConfig,
    pub proxy: ProxyConfig,
    pub integrity: IntegrityConfig,
    pub listing: ListingConfig,
    pub strategies: StrategiesConfig,
}

impl TomlConfig {
    pub fn music_dir(&self, root_folder: &Path) -> PathBuf {
        self.music_dir
            .clone()
            .unwrap_or_else(|| root_folder.join("music"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set
    pub level: String,
    /// Optional file receiving a copy of the log output
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Orchestrator retry policy and payload sanity limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub attempts_per_strategy: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_ms: u64,
    /// Attempt index (0-based) from which strategies route through a proxy
    pub proxy_after_attempt: u32,
    /// Payloads smaller than this are always rejected
    pub min_payload_bytes: u64,
    /// Payloads at least this large pass even with an unhelpful content type
    pub plausible_payload_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            attempts_per_strategy: 3,
            retry_base_delay_ms: 3_000,
            retry_max_delay_ms: 30_000,
            retry_jitter_ms: 2_000,
            proxy_after_attempt: 2,
            min_payload_bytes: 1_000,
            plausible_payload_bytes: 100_000,
        }
    }
}

/// Adaptive per-endpoint spacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Added to the interval per recorded failure once past `slowdown_threshold`
    pub interval_step_ms: u64,
    pub slowdown_threshold: u32,
    pub proxy_threshold: u32,
    pub reset_window_secs: u64,
    /// Ceiling for interval doubling after explicit rate limiting
    pub rate_limit_cap_ms: u64,
    pub warn_every: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 3_000,
            interval_step_ms: 100,
            slowdown_threshold: 10,
            proxy_threshold: 5,
            reset_window_secs: 3_600,
            rate_limit_cap_ms: 5_000,
            warn_every: 5,
        }
    }
}

impl GovernorConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.base_interval_ms))
    }

    pub fn reset_window(&self) -> Duration {
        Duration::from_secs(self.reset_window_secs)
    }

    pub fn rate_limit_cap(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cap_ms.max(self.base_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    /// Public feeds returning one `host:port` per line
    pub sources: Vec<String>,
    /// URL fetched through a candidate relay to check liveness
    pub check_url: String,
    pub ttl_secs: u64,
    pub max_requests_per_proxy: u32,
    pub max_probes_per_call: usize,
    pub probe_timeout_secs: u64,
    pub feed_timeout_secs: u64,
    pub exclusion_clear_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: vec![
                "https://api.proxyscrape.com/v2/?request=get&protocol=http&timeout=10000&country=all&ssl=all&anonymity=all".to_string(),
                "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt".to_string(),
                "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/http.txt".to_string(),
            ],
            check_url: "http://httpbin.org/ip".to_string(),
            ttl_secs: 1_800,
            max_requests_per_proxy: 10,
            max_probes_per_call: 10,
            probe_timeout_secs: 5,
            feed_timeout_secs: 10,
            exclusion_clear_secs: 600,
            max_consecutive_failures: 3,
        }
    }
}

/// Heuristic thresholds for judging a downloaded artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    pub min_file_bytes: u64,
    pub min_bitrate_kbps: u64,
    /// Fraction of the duration-derived estimate a file must reach
    pub size_fraction: f64,
    /// Probed/expected below this ratio means truncated
    pub truncated_ratio: f64,
    /// Probed/expected above this ratio means wrong track
    pub oversized_ratio: f64,
    pub short_track_secs: u64,
    pub short_track_tolerance: f64,
    pub medium_track_secs: u64,
    pub medium_track_tolerance: f64,
    pub long_track_tolerance: f64,
    pub tolerance_floor_secs: f64,
    pub probe_program: String,
    pub probe_timeout_secs: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            min_file_bytes: 100 * 1024,
            min_bitrate_kbps: 32,
            size_fraction: 0.3,
            truncated_ratio: 0.5,
            oversized_ratio: 3.0,
            short_track_secs: 120,
            short_track_tolerance: 0.5,
            medium_track_secs: 300,
            medium_track_tolerance: 0.4,
            long_track_tolerance: 0.35,
            tolerance_floor_secs: 15.0,
            probe_program: "ffprobe".to_string(),
            probe_timeout_secs: 10,
        }
    }
}

/// Remote playlist listing service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://spotdown.app".to_string(),
            timeout_secs: 30,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub direct_api: Option<HttpApiConfig>,
    pub converter: Option<ConverterConfig>,
    pub tools: Vec<ExternalToolConfig>,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            direct_api: Some(HttpApiConfig::default()),
            converter: None,
            tools: vec![
                ExternalToolConfig {
                    id: "spotdl".to_string(),
                    program: "spotdl".to_string(),
                    args: [
                        "--format", "mp3", "--bitrate", "320k", "--threads", "1",
                        "--overwrite", "skip", "--output", "{output_dir}", "{url}",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                    proxy_flag: Some("--proxy".to_string()),
                    timeout_secs: 180,
                },
                ExternalToolConfig {
                    id: "yt-dlp".to_string(),
                    program: "yt-dlp".to_string(),
                    args: [
                        "-x", "--audio-format", "mp3", "--no-playlist", "-o",
                        "{output_dir}/%(title)s.%(ext)s", "ytsearch1:{query}",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                    proxy_flag: Some("--proxy".to_string()),
                    timeout_secs: 180,
                },
            ],
        }
    }
}

/// Service answering `POST /api/download {"url": ...}` with the audio body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpApiConfig {
    pub id: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            id: "direct-api".to_string(),
            base_url: "https://spotdown.app".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Two-stage converter: request a conversion, then fetch the returned link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub id: String,
    pub api_url: String,
    pub timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            id: "converter".to_string(),
            api_url: String::new(),
            timeout_secs: 60,
            download_timeout_secs: 300,
        }
    }
}

/// External command-line downloader.
///
/// Argument placeholders: `{url}`, `{query}`, `{output_dir}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalToolConfig {
    pub id: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub proxy_flag: Option<String>,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

fn default_tool_timeout() -> u64 {
    180
}

/// Locate the config file following the priority order above
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir().map(|d| d.join("plsync").join("config.toml"))
}

/// Load TOML config. A missing file yields defaults; a malformed one is an error.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        warn!("No config file location available, using defaults");
        return Ok(TomlConfig::default());
    };

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(TomlConfig::default());
        }
        Err(e) => {
            return Err(Error::Config(format!(
                "Read {} failed: {}",
                path.display(),
                e
            )))
        }
    };

    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    validate(&config)?;

    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Reject values that would make components misbehave
pub fn validate(config: &TomlConfig) -> Result<()> {
    if config.download.attempts_per_strategy == 0 {
        return Err(Error::Config("download.attempts_per_strategy must be at least 1".to_string()));
    }
    if config.proxy.max_requests_per_proxy == 0 {
        return Err(Error::Config("proxy.max_requests_per_proxy must be at least 1".to_string()));
    }
    if !(0.0..=1.0).contains(&config.integrity.size_fraction) {
        return Err(Error::Config("integrity.size_fraction must be within 0.0..=1.0".to_string()));
    }
    if config.integrity.truncated_ratio >= config.integrity.oversized_ratio {
        return Err(Error::Config(
            "integrity.truncated_ratio must be below integrity.oversized_ratio".to_string(),
        ));
    }

    let mut ids: Vec<&str> = config
        .strategies
        .tools
        .iter()
        .map(|t| t.id.as_str())
        .chain(config.strategies.direct_api.iter().map(|c| c.id.as_str()))
        .chain(config.strategies.converter.iter().map(|c| c.id.as_str()))
        .collect();
    ids.sort_unstable();
    if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::Config(format!("duplicate strategy id '{}'", pair[0])));
    }
    if let Some(api) = &config.strategies.direct_api {
        if api.base_url.trim().is_empty() {
            return Err(Error::Config("strategies.direct_api.base_url is required".to_string()));
        }
    }
    if let Some(converter) = &config.strategies.converter {
        if converter.api_url.trim().is_empty() {
            return Err(Error::Config("strategies.converter.api_url is required".to_string()));
        }
    }

    Ok(())
}

/// Resolve the root folder (CLI → ENV → TOML → OS default)
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("plsync"))
        .unwrap_or_else(|| PathBuf::from("./plsync_data"))
}

/// Write config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
