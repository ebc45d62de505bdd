//! Relay pool for routing requests away from a throttled client address
//!
//! Candidates come from public `host:port` feeds and are refreshed once the
//! cache is older than the TTL. A candidate only joins the working pool after a
//! short liveness check. The current relay is reused until its request budget
//! is spent, then the pool rotates: first to a freshly probed candidate, then
//! round-robin over relays already known to work.
//!
//! Nothing here raises to the caller: an empty pool yields `None` and the
//! request goes out directly.

use async_trait::async_trait;
use plsync_common::config::ProxyConfig;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::USER_AGENT;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Proxy feed {source_url} failed: {message}")]
    Feed { source_url: String, message: String },

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Source of relay candidates
#[async_trait]
pub trait ProxyFeed: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate addresses as `host:port`
    async fn fetch(&self) -> Result<Vec<String>, ProxyError>;
}

/// Short-timeout check that a relay forwards requests
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, address: &str) -> bool;
}

/// A relay that passed the liveness check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub address: String,
    pub consecutive_failures: u32,
    pub requests_since_rotation: u32,
}

impl ProxyRecord {
    fn new(address: String) -> Self {
        Self {
            address,
            consecutive_failures: 0,
            requests_since_rotation: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyStats {
    pub candidates: usize,
    pub working: usize,
    pub excluded: usize,
}

struct PoolState {
    /// Untried candidates, shuffled
    candidates: Vec<String>,
    fetched_at: Option<Instant>,
    working: Vec<ProxyRecord>,
    current: Option<usize>,
    excluded: HashSet<String>,
    excluded_since: Instant,
}

pub struct ProxyPool {
    config: ProxyConfig,
    feeds: Vec<Arc<dyn ProxyFeed>>,
    probe: Arc<dyn LivenessProbe>,
    /// Short critical sections only; never held across feed or probe I/O
    state: Mutex<PoolState>,
    /// One caller at a time refreshes or picks a new relay
    selecting: Mutex<()>,
}

impl ProxyPool {
    pub fn new(
        config: ProxyConfig,
        feeds: Vec<Arc<dyn ProxyFeed>>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            config,
            feeds,
            probe,
            state: Mutex::new(PoolState {
                candidates: Vec::new(),
                fetched_at: None,
                working: Vec::new(),
                current: None,
                excluded: HashSet::new(),
                excluded_since: Instant::now(),
            }),
            selecting: Mutex::new(()),
        }
    }

    /// Pool backed by the configured HTTP feeds and check URL
    pub fn from_config(config: ProxyConfig) -> Result<Self, ProxyError> {
        let feed_timeout = Duration::from_secs(config.feed_timeout_secs);
        let feeds = config
            .sources
            .iter()
            .map(|url| {
                HttpProxyFeed::new(url.clone(), feed_timeout)
                    .map(|feed| Arc::new(feed) as Arc<dyn ProxyFeed>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let probe = Arc::new(HttpLivenessProbe::new(
            config.check_url.clone(),
            Duration::from_secs(config.probe_timeout_secs),
        ));
        Ok(Self::new(config, feeds, probe))
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Pull candidates from every feed, dedup, shuffle
    pub async fn refresh(&self) -> usize {
        let _selecting = self.selecting.lock().await;
        self.refresh_candidates().await
    }

    /// Relay address to use for the next request, or `None` to go direct.
    ///
    /// `force_new` skips the budget check, e.g. after the current relay failed.
    pub async fn acquire(&self, force_new: bool) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let _selecting = self.selecting.lock().await;
        let stale = {
            let mut state = self.state.lock().await;
            self.clear_exclusions_if_due(&mut state);
            state
                .fetched_at
                .map_or(true, |at| at.elapsed() > Duration::from_secs(self.config.ttl_secs))
        };
        if stale {
            self.refresh_candidates().await;
        }

        if !force_new {
            let mut state = self.state.lock().await;
            if let Some(idx) = state.current {
                let budget = self.config.max_requests_per_proxy;
                if let Some(record) = state.working.get_mut(idx) {
                    if record.requests_since_rotation < budget {
                        record.requests_since_rotation += 1;
                        return Some(record.address.clone());
                    }
                    debug!(proxy = %record.address, "Proxy request budget exhausted, rotating");
                }
            }
        }

        if let Some(address) = self.probe_candidates().await {
            return Some(address);
        }

        let mut state = self.state.lock().await;
        self.rotate_working(&mut state, force_new)
    }

    /// The relay could not carry a request
    pub async fn report_failure(&self, address: &str) {
        let mut state = self.state.lock().await;
        let Some(idx) = state.working.iter().position(|r| r.address == address) else {
            return;
        };

        state.working[idx].consecutive_failures += 1;
        if state.working[idx].consecutive_failures < self.config.max_consecutive_failures {
            return;
        }

        let evicted = state.working.remove(idx);
        warn!(proxy = %evicted.address, "Proxy failed repeatedly, evicting from pool");
        state.excluded.insert(evicted.address);
        state.current = match state.current {
            Some(current) if current == idx => None,
            Some(current) if current > idx => Some(current - 1),
            other => other,
        };
    }

    pub async fn report_success(&self, address: &str) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.working.iter_mut().find(|r| r.address == address) {
            record.consecutive_failures = 0;
        }
    }

    pub async fn stats(&self) -> ProxyStats {
        let state = self.state.lock().await;
        ProxyStats {
            candidates: state.candidates.len(),
            working: state.working.len(),
            excluded: state.excluded.len(),
        }
    }

    /// Caller holds `selecting`
    async fn refresh_candidates(&self) -> usize {
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for feed in &self.feeds {
            match feed.fetch().await {
                Ok(addresses) => {
                    debug!(feed = feed.name(), count = addresses.len(), "Fetched proxy candidates");
                    fresh.extend(addresses.into_iter().filter(|a| seen.insert(a.clone())));
                }
                Err(e) => warn!(feed = feed.name(), "Proxy feed unavailable: {}", e),
            }
        }

        let mut state = self.state.lock().await;
        fresh.retain(|a| !state.working.iter().any(|r| &r.address == a));
        fresh.shuffle(&mut rand::thread_rng());

        state.fetched_at = Some(Instant::now());
        // Keep the old list when every feed failed
        if !fresh.is_empty() {
            state.candidates = fresh;
        }

        info!("Updated proxy list: {} candidates available", state.candidates.len());
        state.candidates.len()
    }

    /// Check up to `max_probes_per_call` untried candidates, adopting the first live one.
    /// Caller holds `selecting`; the state lock is released while a probe runs.
    async fn probe_candidates(&self) -> Option<String> {
        let mut probes = 0;
        while probes < self.config.max_probes_per_call {
            let candidate = {
                let mut state = self.state.lock().await;
                loop {
                    let candidate = state.candidates.pop()?;
                    if !state.excluded.contains(&candidate)
                        && !state.working.iter().any(|r| r.address == candidate)
                    {
                        break candidate;
                    }
                }
            };

            probes += 1;
            let alive = self.probe.is_alive(&candidate).await;
            let mut state = self.state.lock().await;
            if alive {
                info!(proxy = %candidate, "Using proxy");
                let mut record = ProxyRecord::new(candidate.clone());
                record.requests_since_rotation = 1;
                state.working.push(record);
                state.current = Some(state.working.len() - 1);
                return Some(candidate);
            }

            debug!(proxy = %candidate, "Proxy failed liveness check");
            state.excluded.insert(candidate);
        }
        None
    }

    /// Round-robin to the next known-good relay
    fn rotate_working(&self, state: &mut PoolState, force_new: bool) -> Option<String> {
        let len = state.working.len();
        if len == 0 {
            state.current = None;
            return None;
        }

        let next = match state.current {
            Some(current) if len == 1 && force_new => {
                debug!(proxy = %state.working[current].address, "No alternative proxy available");
                return None;
            }
            Some(current) => (current + 1) % len,
            None => 0,
        };

        state.current = Some(next);
        let record = &mut state.working[next];
        record.requests_since_rotation = 1;
        Some(record.address.clone())
    }

    fn clear_exclusions_if_due(&self, state: &mut PoolState) {
        if state.excluded_since.elapsed() > Duration::from_secs(self.config.exclusion_clear_secs) {
            if !state.excluded.is_empty() {
                debug!(count = state.excluded.len(), "Clearing proxy exclusion set");
            }
            state.excluded.clear();
            state.excluded_since = Instant::now();
        }
    }
}

/// Extract `host:port` entries from a plain-text feed
pub fn parse_proxy_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|entry| {
            let Some((host, port)) = entry.rsplit_once(':') else {
                return false;
            };
            !host.is_empty()
                && !host.contains('/')
                && port.parse::<u16>().map_or(false, |p| p > 0)
        })
        .map(str::to_string)
        .collect()
}

/// Plain-text feed served over HTTP
pub struct HttpProxyFeed {
    url: String,
    client: reqwest::Client,
}

impl HttpProxyFeed {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Client(e.to_string()))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl ProxyFeed for HttpProxyFeed {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<String>, ProxyError> {
        let feed_error = |message: String| ProxyError::Feed {
            source_url: self.url.clone(),
            message,
        };

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| feed_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(feed_error(format!("HTTP {}", response.status())));
        }

        let body = response.text().await.map_err(|e| feed_error(e.to_string()))?;
        Ok(parse_proxy_lines(&body))
    }
}

/// Fetches the check URL through the relay
pub struct HttpLivenessProbe {
    check_url: String,
    timeout: Duration,
}

impl HttpLivenessProbe {
    pub fn new(check_url: String, timeout: Duration) -> Self {
        Self { check_url, timeout }
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn is_alive(&self, address: &str) -> bool {
        let proxy = match reqwest::Proxy::all(format!("http://{}", address)) {
            Ok(proxy) => proxy,
            Err(_) => return false,
        };
        let client = match reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
        {
            Ok(client) => client,
            Err(_) => return false,
        };

        match client.get(&self.check_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    struct StaticFeed(Vec<String>);

    #[async_trait]
    impl ProxyFeed for StaticFeed {
        fn name(&self) -> &str {
            "static"
        }

        async fn fetch(&self) -> Result<Vec<String>, ProxyError> {
            Ok(self.0.clone())
        }
    }

    struct DeadSet(HashSet<String>);

    #[async_trait]
    impl LivenessProbe for DeadSet {
        async fn is_alive(&self, address: &str) -> bool {
            !self.0.contains(address)
        }
    }

    fn pool(addresses: &[&str], dead: &[&str], max_requests: u32) -> ProxyPool {
        let config = ProxyConfig {
            max_requests_per_proxy: max_requests,
            ..ProxyConfig::default()
        };
        ProxyPool::new(
            config,
            vec![Arc::new(StaticFeed(addresses.iter().map(|s| s.to_string()).collect()))],
            Arc::new(DeadSet(dead.iter().map(|s| s.to_string()).collect())),
        )
    }

    #[test]
    fn test_parse_proxy_lines() {
        let text = "1.2.3.4:8080\r\n  \nnot a proxy\nhost.example:3128 extra\n5.6.7.8:notaport\n9.9.9.9:0\n";
        assert_eq!(parse_proxy_lines(text), vec!["1.2.3.4:8080", "host.example:3128"]);
    }

    #[tokio::test]
    async fn test_sticky_until_budget_spent() {
        let pool = pool(&["a:1", "b:2", "c:3"], &[], 3);

        let first = pool.acquire(false).await.unwrap();
        assert_eq!(pool.acquire(false).await.as_deref(), Some(first.as_str()));
        assert_eq!(pool.acquire(false).await.as_deref(), Some(first.as_str()));

        let fourth = pool.acquire(false).await.unwrap();
        assert_ne!(fourth, first);
    }

    #[tokio::test]
    async fn test_dead_candidates_excluded() {
        let pool = pool(&["a:1", "b:2"], &["a:1", "b:2"], 10);
        assert_eq!(pool.acquire(false).await, None);

        let stats = pool.stats().await;
        assert_eq!(stats.working, 0);
        assert_eq!(stats.excluded, 2);
    }

    #[tokio::test]
    async fn test_round_robin_when_candidates_run_out() {
        let pool = pool(&["a:1", "b:2"], &[], 1);
        let first = pool.acquire(false).await.unwrap();
        let second = pool.acquire(false).await.unwrap();
        let third = pool.acquire(false).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn test_eviction_after_consecutive_failures() {
        let pool = pool(&["a:1"], &[], 10);
        let address = pool.acquire(false).await.unwrap();

        pool.report_failure(&address).await;
        pool.report_failure(&address).await;
        pool.report_success(&address).await;
        pool.report_failure(&address).await;
        assert_eq!(pool.stats().await.working, 1);

        pool.report_failure(&address).await;
        pool.report_failure(&address).await;
        let stats = pool.stats().await;
        assert_eq!(stats.working, 0);
        assert_eq!(stats.excluded, 1);
        assert_eq!(pool.acquire(true).await, None);
    }

    struct GatedProbe {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LivenessProbe for GatedProbe {
        async fn is_alive(&self, _: &str) -> bool {
            self.entered.notify_one();
            self.release.notified().await;
            true
        }
    }

    #[tokio::test]
    async fn test_reports_not_blocked_by_liveness_check() {
        let probe = Arc::new(GatedProbe {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let pool = Arc::new(ProxyPool::new(
            ProxyConfig::default(),
            vec![Arc::new(StaticFeed(vec!["a:1".to_string()]))],
            Arc::clone(&probe) as Arc<dyn LivenessProbe>,
        ));

        let acquiring = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire(false).await }
        });
        probe.entered.notified().await;

        let stats = tokio::time::timeout(Duration::from_secs(5), pool.stats())
            .await
            .unwrap();
        assert_eq!(stats.working, 0);
        tokio::time::timeout(Duration::from_secs(5), pool.report_failure("a:1"))
            .await
            .unwrap();

        probe.release.notify_one();
        assert_eq!(acquiring.await.unwrap().as_deref(), Some("a:1"));
        assert_eq!(pool.stats().await.working, 1);
    }

    #[tokio::test]
    async fn test_disabled_pool_goes_direct() {
        let config = ProxyConfig {
            enabled: false,
            ..ProxyConfig::default()
        };
        let pool = ProxyPool::new(config, Vec::new(), Arc::new(DeadSet(HashSet::new())));
        assert_eq!(pool.acquire(false).await, None);
    }
}
