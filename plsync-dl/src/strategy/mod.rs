//! Acquisition strategies
//!
//! Every way of obtaining audio for a track implements [`AcquisitionStrategy`].
//! A strategy makes one attempt per `fetch` call and reports what went wrong as
//! a [`StrategyError`]; retrying and falling through to the next strategy is
//! the orchestrator's job.

pub mod converter;
pub mod external_tool;
pub mod http_api;

pub use converter::ConverterStrategy;
pub use external_tool::ExternalToolStrategy;
pub use http_api::HttpApiStrategy;

use async_trait::async_trait;
use plsync_common::TrackDescriptor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proxy_pool::ProxyPool;
use crate::rate_governor::RateGovernor;
use crate::USER_AGENT;

/// Why a single attempt failed. Drives the orchestrator's retry decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrategyError {
    /// Network hiccup, timeout, 5xx: worth retrying
    #[error("Transient network error: {0}")]
    Transient(String),

    /// Upstream asked us to slow down
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// This strategy cannot serve the track; move on
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// Something arrived but it is not usable audio
    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// Misconfiguration; retrying cannot help
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cancelled")]
    Cancelled,
}

/// What a strategy needs to know about the track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub title: String,
    pub artist: String,
    pub url: String,
}

impl FetchRequest {
    /// "Artist - Title" used by search-based strategies
    pub fn query(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

impl From<&TrackDescriptor> for FetchRequest {
    fn from(track: &TrackDescriptor) -> Self {
        Self {
            title: track.title().to_string(),
            artist: track.artist().to_string(),
            url: track.url().to_string(),
        }
    }
}

/// Per-attempt information handed to a strategy
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 0-based attempt number within the current strategy
    pub attempt: u32,
    /// Attempt number from which requests go through a relay
    pub proxy_after_attempt: u32,
    pub cancel: CancellationToken,
}

impl AttemptContext {
    pub fn new(attempt: u32, proxy_after_attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            attempt,
            proxy_after_attempt,
            cancel,
        }
    }

    pub fn wants_proxy(&self, governor: Option<&RateGovernor>) -> bool {
        self.attempt >= self.proxy_after_attempt
            || governor.map_or(false, |g| g.should_use_proxy())
    }
}

#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    /// Stable id used in the persisted strategy order
    fn id(&self) -> &str;

    /// Whether the strategy can run at all in this environment
    async fn is_available(&self) -> bool;

    /// One attempt to place validated audio at `dest`. Returns bytes written.
    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        ctx: &AttemptContext,
    ) -> Result<u64, StrategyError>;
}

/// Relay selection shared by the strategies
#[derive(Clone, Default)]
pub struct ProxyRouting {
    pool: Option<Arc<ProxyPool>>,
}

impl ProxyRouting {
    pub fn new(pool: Option<Arc<ProxyPool>>) -> Self {
        Self { pool }
    }

    pub fn direct() -> Self {
        Self { pool: None }
    }

    /// Relay for this attempt, if proxy routing applies and one is available
    pub async fn select(
        &self,
        ctx: &AttemptContext,
        governor: Option<&RateGovernor>,
    ) -> Option<String> {
        if !ctx.wants_proxy(governor) {
            return None;
        }
        let pool = self.pool.as_ref()?;
        match pool.acquire(false).await {
            Some(address) => {
                info!(proxy = %address, attempt = ctx.attempt + 1, "Using proxy for download attempt");
                Some(address)
            }
            None => {
                info!(attempt = ctx.attempt + 1, "No working proxy available, trying direct connection");
                None
            }
        }
    }

    pub async fn report(&self, proxy: Option<&str>, ok: bool) {
        if let (Some(pool), Some(address)) = (&self.pool, proxy) {
            if ok {
                pool.report_success(address).await;
            } else {
                pool.report_failure(address).await;
            }
        }
    }
}

/// HTTP client for one attempt, optionally routed through `proxy`
pub fn build_client(timeout: Duration, proxy: Option<&str>) -> Result<reqwest::Client, StrategyError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout);

    if let Some(address) = proxy {
        let relay = reqwest::Proxy::all(format!("http://{}", address))
            .map_err(|e| StrategyError::Configuration(format!("bad proxy {}: {}", address, e)))?;
        builder = builder.proxy(relay);
    }

    builder
        .build()
        .map_err(|e| StrategyError::Configuration(e.to_string()))
}

/// Map a non-success HTTP status onto the retry taxonomy
pub fn classify_status(status: reqwest::StatusCode, context: &str) -> StrategyError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        StrategyError::RateLimited(format!("{}: HTTP 429", context))
    } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
        StrategyError::Transient(format!("{}: HTTP {}", context, status.as_u16()))
    } else {
        StrategyError::Unavailable(format!("{}: HTTP {}", context, status.as_u16()))
    }
}

/// Map a transport error onto the retry taxonomy
pub fn classify_transport(err: &reqwest::Error, context: &str) -> StrategyError {
    if err.is_builder() {
        StrategyError::Configuration(format!("{}: {}", context, err))
    } else {
        debug!("{} transport error: {}", context, err);
        StrategyError::Transient(format!("{}: {}", context, err))
    }
}

/// Record the outcome of an HTTP attempt on its governor
pub fn record_outcome(governor: &RateGovernor, result: &Result<u64, StrategyError>) {
    match result {
        Ok(_) => governor.record_success(),
        Err(StrategyError::RateLimited(_)) => governor.record_rate_limited(),
        Err(StrategyError::Transient(_)) | Err(StrategyError::CorruptArtifact(_)) => {
            governor.record_failure()
        }
        Err(_) => {}
    }
}
