//! Adaptive per-endpoint request spacing
//!
//! Each upstream endpoint gets one [`RateGovernor`]. It enforces a minimum
//! interval between requests and widens that interval as failures accumulate.
//! Past the proxy threshold it tells callers to route through a relay right
//! away. Failure history is forgotten after the reset window, so a governor
//! never blocks an endpoint permanently.

use plsync_common::config::GovernorConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::sleep_or_cancel;

/// Point-in-time view of a governor, for logs and the CLI
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorSnapshot {
    pub endpoint: String,
    pub failure_count: u32,
    pub min_interval: Duration,
    pub use_proxy: bool,
}

#[derive(Debug)]
struct GovernorState {
    failure_count: u32,
    last_reset: Instant,
    min_interval: Duration,
    /// Time the most recently reserved request is allowed to start
    last_slot: Option<Instant>,
}

pub struct RateGovernor {
    endpoint: String,
    config: GovernorConfig,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(endpoint: impl Into<String>, config: GovernorConfig) -> Self {
        let min_interval = config.base_interval();
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(GovernorState {
                failure_count: 0,
                last_reset: Instant::now(),
                min_interval,
                last_slot: None,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait until the next request to this endpoint may start.
    ///
    /// The slot is reserved under the lock, so concurrent callers queue up one
    /// interval apart. Returns `false` if cancelled while waiting.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        let wait_time = {
            let mut state = self.lock();
            let now = Instant::now();
            let slot = match state.last_slot {
                Some(previous) => (previous + state.min_interval).max(now),
                None => now,
            };
            state.last_slot = Some(slot);
            slot.saturating_duration_since(now)
        };

        if !wait_time.is_zero() {
            debug!(endpoint = %self.endpoint, ?wait_time, "Rate limiting: waiting");
        }
        sleep_or_cancel(wait_time, cancel).await
    }

    /// Count a failed request and adapt spacing
    pub fn record_failure(&self) {
        let mut state = self.lock();
        self.count_failure(&mut state);
    }

    /// Explicit throttling from upstream (HTTP 429): double spacing and count a failure
    pub fn record_rate_limited(&self) {
        let mut state = self.lock();
        let doubled = state.min_interval.saturating_mul(2);
        state.min_interval = doubled.min(self.config.rate_limit_cap());
        info!(
            endpoint = %self.endpoint,
            min_interval_ms = state.min_interval.as_millis() as u64,
            "Rate limited by upstream, increasing delays"
        );
        self.count_failure(&mut state);
    }

    /// A success slowly pays down the failure count
    pub fn record_success(&self) {
        let mut state = self.lock();
        state.failure_count = state.failure_count.saturating_sub(1);
        state.min_interval = if state.failure_count > self.config.slowdown_threshold {
            self.widened_interval(state.failure_count)
        } else {
            self.config.base_interval()
        };
    }

    /// Route through a relay immediately instead of waiting for the retry threshold
    pub fn should_use_proxy(&self) -> bool {
        self.lock().failure_count > self.config.proxy_threshold
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn min_interval(&self) -> Duration {
        self.lock().min_interval
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.lock();
        GovernorSnapshot {
            endpoint: self.endpoint.clone(),
            failure_count: state.failure_count,
            min_interval: state.min_interval,
            use_proxy: state.failure_count > self.config.proxy_threshold,
        }
    }

    fn count_failure(&self, state: &mut GovernorState) {
        state.failure_count = state.failure_count.saturating_add(1);

        if state.last_reset.elapsed() > self.config.reset_window() {
            state.failure_count = 0;
            state.last_reset = Instant::now();
            state.min_interval = self.config.base_interval();
            debug!(endpoint = %self.endpoint, "Failure window elapsed, counters reset");
            return;
        }

        if self.config.warn_every > 0 && state.failure_count % self.config.warn_every == 0 {
            warn!(
                endpoint = %self.endpoint,
                failures = state.failure_count,
                "Repeated failures, switching to more aggressive retry behaviour"
            );
        }

        if state.failure_count > self.config.slowdown_threshold {
            let widened = self.widened_interval(state.failure_count);
            if widened > state.min_interval {
                state.min_interval = widened;
            }
        }
    }

    fn widened_interval(&self, failures: u32) -> Duration {
        let step = Duration::from_millis(self.config.interval_step_ms).saturating_mul(failures);
        (self.config.base_interval() + step).min(self.config.max_interval())
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        // State is plain counters; a panic mid-update cannot leave it unusable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hands out one shared governor per endpoint key
pub struct GovernorRegistry {
    config: GovernorConfig,
    governors: Mutex<HashMap<String, Arc<RateGovernor>>>,
}

impl GovernorRegistry {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            governors: Mutex::new(HashMap::new()),
        }
    }

    /// Governor for a URL, keyed by its host
    pub fn for_url(&self, url: &str) -> Arc<RateGovernor> {
        let key = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| url.to_string());
        self.get(&key)
    }

    pub fn get(&self, endpoint: &str) -> Arc<RateGovernor> {
        let mut governors = self
            .governors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        governors
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(RateGovernor::new(endpoint, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<GovernorSnapshot> {
        let governors = self
            .governors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshots: Vec<_> = governors.values().map(|g| g.snapshot()).collect();
        snapshots.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshots
    }
}
