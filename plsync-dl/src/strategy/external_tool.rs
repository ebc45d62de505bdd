//! Command-line downloaders (spotdl, yt-dlp, ...)
//!
//! The tool runs in a private scratch directory so concurrent runs never see
//! each other's output. The newest `.mp3` it leaves behind is validated and
//! moved to the destination; the scratch directory is always removed.

use async_trait::async_trait;
use plsync_common::config::ExternalToolConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{AcquisitionStrategy, AttemptContext, FetchRequest, ProxyRouting, StrategyError};
use crate::payload::{move_into_place, PayloadPolicy};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ExternalToolStrategy {
    config: ExternalToolConfig,
    scratch_root: PathBuf,
    routing: ProxyRouting,
    policy: PayloadPolicy,
    available: OnceCell<bool>,
}

impl ExternalToolStrategy {
    pub fn new(
        config: ExternalToolConfig,
        scratch_root: PathBuf,
        routing: ProxyRouting,
        policy: PayloadPolicy,
    ) -> Self {
        Self {
            config,
            scratch_root,
            routing,
            policy,
            available: OnceCell::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.config.program
    }

    /// Substitute `{url}`, `{query}` and `{output_dir}` into the configured arguments
    pub fn render_args(&self, request: &FetchRequest, output_dir: &Path) -> Vec<String> {
        let output_dir = output_dir.to_string_lossy();
        let query = request.query();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{url}", &request.url)
                    .replace("{query}", &query)
                    .replace("{output_dir}", &output_dir)
            })
            .collect()
    }

    async fn probe_version(&self) -> bool {
        let status = Command::new(&self.config.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(VERSION_CHECK_TIMEOUT, status).await {
            Ok(Ok(status)) if status.success() => {
                debug!(program = %self.config.program, "External downloader available");
                true
            }
            Ok(Ok(status)) => {
                warn!(program = %self.config.program, %status, "External downloader version check failed");
                false
            }
            Ok(Err(e)) => {
                debug!(program = %self.config.program, "External downloader not found: {}", e);
                false
            }
            Err(_) => {
                warn!(program = %self.config.program, "External downloader version check timed out");
                false
            }
        }
    }

    async fn run_tool(
        &self,
        request: &FetchRequest,
        scratch: &Path,
        dest: &Path,
        ctx: &AttemptContext,
        proxy: Option<&str>,
    ) -> Result<u64, StrategyError> {
        let mut args = self.render_args(request, scratch);
        if let (Some(flag), Some(address)) = (&self.config.proxy_flag, proxy) {
            args.insert(0, format!("http://{}", address));
            args.insert(0, flag.clone());
        }

        debug!(program = %self.config.program, ?args, "Running external downloader");
        let child = Command::new(&self.config.program)
            .args(&args)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StrategyError::Unavailable(format!("{} not installed", self.config.program))
                } else {
                    StrategyError::Transient(format!("spawn {}: {}", self.config.program, e))
                }
            })?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        // Dropping the future on timeout or cancel kills the child
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(StrategyError::Cancelled),
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(StrategyError::Transient(format!("{}: {}", self.config.id, e))),
                Err(_) => {
                    return Err(StrategyError::Transient(format!(
                        "{} timed out after {}s",
                        self.config.id, self.config.timeout_secs
                    )))
                }
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(StrategyError::Transient(format!(
                "{} exited with {}: {}",
                self.config.id, output.status, tail
            )));
        }

        let produced = newest_mp3(scratch).await.ok_or_else(|| {
            StrategyError::Unavailable(format!("{} produced no audio file", self.config.id))
        })?;

        let bytes = self.policy.check_file(&produced).await?;
        move_into_place(&produced, dest)
            .await
            .map_err(|e| StrategyError::Transient(format!("move into {}: {}", dest.display(), e)))?;
        Ok(bytes)
    }
}

/// Most recently modified `.mp3` directly inside `dir`
async fn newest_mp3(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_mp3 = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case(plsync_common::paths::AUDIO_EXTENSION));
        if !is_mp3 {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    newest.map(|(_, path)| path)
}

#[async_trait]
impl AcquisitionStrategy for ExternalToolStrategy {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn is_available(&self) -> bool {
        *self.available.get_or_init(|| self.probe_version()).await
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        ctx: &AttemptContext,
    ) -> Result<u64, StrategyError> {
        let scratch = self
            .scratch_root
            .join(format!("plsync-{}-{}", self.config.id, uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| StrategyError::Configuration(format!("scratch dir {}: {}", scratch.display(), e)))?;

        let proxy = if self.config.proxy_flag.is_some() {
            self.routing.select(ctx, None).await
        } else {
            None
        };

        let result = self.run_tool(request, &scratch, dest, ctx, proxy.as_deref()).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!("Failed to remove scratch dir {}: {}", scratch.display(), e);
        }
        if proxy.is_some() {
            let relay_ok = !matches!(result, Err(StrategyError::Transient(_)));
            self.routing.report(proxy.as_deref(), relay_ok).await;
        }

        if let Ok(bytes) = result {
            info!(strategy = %self.config.id, bytes, "Downloaded via external tool");
        }
        result
    }
}
