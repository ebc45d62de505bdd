//! Multi-strategy download orchestration
//!
//! Strategies are tried in the persisted priority order. Each one gets a fixed
//! number of attempts; the error kind of every attempt decides whether to back
//! off and retry, move to the next strategy, or stop. The first success wins.
//! Failures never escape as errors: the caller gets a [`DownloadOutcome`].

use plsync_common::TrackDescriptor;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::{sleep_or_cancel, Backoff};
use crate::strategy::{AcquisitionStrategy, AttemptContext, FetchRequest, StrategyError};

/// Why one strategy gave up on a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { strategy: String, bytes: u64 },
    Failed { failures: Vec<StrategyFailure> },
    Cancelled,
}

impl DownloadOutcome {
    pub fn is_downloaded(&self) -> bool {
        matches!(self, DownloadOutcome::Downloaded { .. })
    }
}

/// Retry policy applied to every strategy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts_per_strategy: u32,
    pub proxy_after_attempt: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &plsync_common::config::DownloadConfig) -> Self {
        Self {
            attempts_per_strategy: config.attempts_per_strategy.max(1),
            proxy_after_attempt: config.proxy_after_attempt,
            backoff: Backoff::from_config(config),
        }
    }
}

pub struct DownloadOrchestrator {
    strategies: HashMap<String, Arc<dyn AcquisitionStrategy>>,
    policy: RetryPolicy,
}

impl DownloadOrchestrator {
    pub fn new(strategies: Vec<Arc<dyn AcquisitionStrategy>>, policy: RetryPolicy) -> Self {
        let strategies = strategies
            .into_iter()
            .map(|s| (s.id().to_string(), s))
            .collect();
        Self { strategies, policy }
    }

    /// Registered strategy ids, sorted
    pub fn strategy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.strategies.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Acquire `track` into `dest` using the strategies named in `order`
    pub async fn download(
        &self,
        track: &TrackDescriptor,
        dest: &Path,
        order: &[String],
        cancel: &CancellationToken,
    ) -> DownloadOutcome {
        let request = FetchRequest::from(track);
        let mut failures = Vec::new();

        for id in order {
            if cancel.is_cancelled() {
                return DownloadOutcome::Cancelled;
            }

            let Some(strategy) = self.strategies.get(id) else {
                warn!(strategy = %id, "Unknown strategy in configured order, skipping");
                continue;
            };

            if !strategy.is_available().await {
                debug!(strategy = %id, "Strategy not available, skipping");
                failures.push(StrategyFailure {
                    strategy: id.clone(),
                    reason: "not available".to_string(),
                });
                continue;
            }

            match self.run_strategy(strategy.as_ref(), &request, dest, cancel).await {
                Ok(bytes) => {
                    info!(
                        track = %track.display_name(),
                        strategy = %id,
                        bytes,
                        "Track downloaded"
                    );
                    return DownloadOutcome::Downloaded {
                        strategy: id.clone(),
                        bytes,
                    };
                }
                Err(StrategyError::Cancelled) => return DownloadOutcome::Cancelled,
                Err(e) => {
                    warn!(track = %track.display_name(), strategy = %id, "Strategy failed: {}", e);
                    failures.push(StrategyFailure {
                        strategy: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        warn!(
            track = %track.display_name(),
            tried = failures.len(),
            "All download strategies failed"
        );
        DownloadOutcome::Failed { failures }
    }

    /// Attempt loop for one strategy. Returns the last error once it gives up.
    async fn run_strategy(
        &self,
        strategy: &dyn AcquisitionStrategy,
        request: &FetchRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, StrategyError> {
        let attempts = self.policy.attempts_per_strategy.max(1);
        let mut last_error = StrategyError::Unavailable("no attempt made".to_string());

        for attempt in 0..attempts {
            let ctx = AttemptContext::new(attempt, self.policy.proxy_after_attempt, cancel.clone());

            match strategy.fetch(request, dest, &ctx).await {
                Ok(bytes) => return Ok(bytes),
                Err(StrategyError::Cancelled) => return Err(StrategyError::Cancelled),
                Err(e @ StrategyError::Unavailable(_)) => return Err(e),
                Err(e @ StrategyError::Configuration(_)) => {
                    error!(strategy = %strategy.id(), "Strategy misconfigured: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        strategy = %strategy.id(),
                        attempt = attempt + 1,
                        attempts,
                        "Attempt failed: {}",
                        e
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < attempts {
                let delay = self.policy.backoff.delay(attempt);
                debug!(strategy = %strategy.id(), ?delay, "Backing off before retry");
                if !sleep_or_cancel(delay, cancel).await {
                    return Err(StrategyError::Cancelled);
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Strategy replaying a fixed script of results
    struct Scripted {
        id: String,
        available: bool,
        script: Mutex<Vec<Result<u64, StrategyError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(id: &str, available: bool, mut script: Vec<Result<u64, StrategyError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                id: id.to_string(),
                available,
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AcquisitionStrategy for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn fetch(&self, _: &FetchRequest, _: &Path, _: &AttemptContext) -> Result<u64, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(StrategyError::Transient("script exhausted".to_string())))
        }
    }

    fn orchestrator(strategies: &[&Arc<Scripted>]) -> DownloadOrchestrator {
        DownloadOrchestrator::new(
            strategies
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn AcquisitionStrategy>)
                .collect(),
            RetryPolicy {
                attempts_per_strategy: 3,
                proxy_after_attempt: 2,
                backoff: Backoff::immediate(),
            },
        )
    }

    fn order(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn track() -> TrackDescriptor {
        TrackDescriptor::new("Song", "Band", "https://open.spotify.com/track/1", Some(180)).unwrap()
    }

    #[tokio::test]
    async fn test_transient_retried_then_success() {
        let a = Scripted::new("a", true, vec![
            Err(StrategyError::Transient("timeout".into())),
            Err(StrategyError::RateLimited("429".into())),
            Ok(5_000),
        ]);
        let o = orchestrator(&[&a]);

        let outcome = o.download(&track(), Path::new("/tmp/x.mp3"), &order(&["a"]), &CancellationToken::new()).await;
        assert_eq!(outcome, DownloadOutcome::Downloaded { strategy: "a".into(), bytes: 5_000 });
        assert_eq!(a.calls(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_artifact_retries_same_strategy() {
        let a = Scripted::new("a", true, vec![
            Err(StrategyError::CorruptArtifact("html error page".into())),
            Ok(7_000),
        ]);
        let b = Scripted::new("b", true, vec![Ok(1)]);
        let o = orchestrator(&[&a, &b]);

        let outcome = o.download(&track(), Path::new("/tmp/x.mp3"), &order(&["a", "b"]), &CancellationToken::new()).await;
        assert_eq!(outcome, DownloadOutcome::Downloaded { strategy: "a".into(), bytes: 7_000 });
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_moves_to_next_without_retry() {
        let a = Scripted::new("a", true, vec![Err(StrategyError::Unavailable("404".into()))]);
        let b = Scripted::new("b", true, vec![Ok(1)]);
        let o = orchestrator(&[&a, &b]);

        let outcome = o.download(&track(), Path::new("/tmp/x.mp3"), &order(&["a", "b"]), &CancellationToken::new()).await;
        assert!(outcome.is_downloaded());
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_fail_reports_each_strategy() {
        let a = Scripted::new("a", true, vec![]);
        let b = Scripted::new("b", true, vec![Err(StrategyError::Configuration("no key".into()))]);
        let o = orchestrator(&[&a, &b]);

        let outcome = o
            .download(&track(), Path::new("/tmp/x.mp3"), &order(&["missing", "a", "b"]), &CancellationToken::new())
            .await;
        let DownloadOutcome::Failed { failures } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].strategy, "a");
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let a = Scripted::new("a", true, vec![Ok(1)]);
        let o = orchestrator(&[&a]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = o.download(&track(), Path::new("/tmp/x.mp3"), &order(&["a"]), &cancel).await;
        assert_eq!(outcome, DownloadOutcome::Cancelled);
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_from_strategy_stops_everything() {
        let a = Scripted::new("a", true, vec![Err(StrategyError::Cancelled)]);
        let b = Scripted::new("b", true, vec![Ok(1)]);
        let o = orchestrator(&[&a, &b]);

        let outcome = o.download(&track(), Path::new("/tmp/x.mp3"), &order(&["a", "b"]), &CancellationToken::new()).await;
        assert_eq!(outcome, DownloadOutcome::Cancelled);
        assert_eq!(b.calls(), 0);
    }
}
