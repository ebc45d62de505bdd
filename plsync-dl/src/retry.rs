//! Backoff and cancellable delay
//!
//! Every wait in the acquisition path goes through [`sleep_or_cancel`] so a
//! playlist-wide operation can be stopped between attempts.

use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    pub fn from_config(config: &plsync_common::config::DownloadConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            Duration::from_millis(config.retry_jitter_ms),
        )
    }

    /// Delay before retry number `attempt` (0-based): base × 2^attempt, capped, plus jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let exponential = self.base.saturating_mul(factor).min(self.max);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return exponential;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        exponential + Duration::from_millis(extra)
    }

    /// No delay at all (tests)
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }

    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(10), Duration::ZERO);
        assert_eq!(backoff.delay(0), Duration::from_secs(3));
        assert_eq!(backoff.delay(1), Duration::from_secs(6));
        assert_eq!(backoff.delay(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounded() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), Duration::from_millis(50));
        for _ in 0..20 {
            let d = backoff.delay(0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &cancel).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(10), &cancel).await);
    }
}
