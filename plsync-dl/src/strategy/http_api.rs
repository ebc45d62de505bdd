//! Direct download API
//!
//! `POST {base_url}/api/download` with `{"url": <track url>}`; the response
//! body is the audio file.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    build_client, classify_status, classify_transport, record_outcome, AcquisitionStrategy,
    AttemptContext, FetchRequest, ProxyRouting, StrategyError,
};
use crate::payload::{write_atomic, PayloadPolicy};
use crate::rate_governor::RateGovernor;

pub struct HttpApiStrategy {
    id: String,
    base_url: String,
    endpoint: String,
    timeout: Duration,
    governor: Arc<RateGovernor>,
    routing: ProxyRouting,
    policy: PayloadPolicy,
}

impl HttpApiStrategy {
    pub fn new(
        id: impl Into<String>,
        base_url: &str,
        timeout: Duration,
        governor: Arc<RateGovernor>,
        routing: ProxyRouting,
        policy: PayloadPolicy,
    ) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Self {
            id: id.into(),
            endpoint: format!("{}/api/download", base_url),
            base_url,
            timeout,
            governor,
            routing,
            policy,
        }
    }

    async fn attempt(
        &self,
        request: &FetchRequest,
        dest: &Path,
        proxy: Option<&str>,
    ) -> Result<u64, StrategyError> {
        let client = build_client(self.timeout, proxy)?;

        debug!(endpoint = %self.endpoint, url = %request.url, "Requesting download");
        let response = client
            .post(&self.endpoint)
            .json(&json!({ "url": request.url }))
            .send()
            .await
            .map_err(|e| classify_transport(&e, &self.id))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &self.id));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, &self.id))?;

        self.policy.check(&body, content_type.as_deref())?;

        write_atomic(dest, &body)
            .await
            .map_err(|e| StrategyError::Transient(format!("write {}: {}", dest.display(), e)))?;

        Ok(body.len() as u64)
    }
}

#[async_trait]
impl AcquisitionStrategy for HttpApiStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        !self.base_url.is_empty()
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        ctx: &AttemptContext,
    ) -> Result<u64, StrategyError> {
        if !self.governor.wait(&ctx.cancel).await {
            return Err(StrategyError::Cancelled);
        }

        let proxy = self.routing.select(ctx, Some(&self.governor)).await;

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(StrategyError::Cancelled),
            result = self.attempt(request, dest, proxy.as_deref()) => result,
        };

        record_outcome(&self.governor, &result);
        if proxy.is_some() {
            let relay_ok = !matches!(result, Err(StrategyError::Transient(_)));
            self.routing.report(proxy.as_deref(), relay_ok).await;
        }

        if let Ok(bytes) = result {
            info!(strategy = %self.id, bytes, "Downloaded via direct API");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plsync_common::config::GovernorConfig;
    use tokio_util::sync::CancellationToken;

    fn strategy(base_url: &str) -> HttpApiStrategy {
        HttpApiStrategy::new(
            "direct-api",
            base_url,
            Duration::from_secs(5),
            Arc::new(RateGovernor::new("test", GovernorConfig {
                base_interval_ms: 0,
                ..GovernorConfig::default()
            })),
            ProxyRouting::direct(),
            PayloadPolicy::default(),
        )
    }

    fn request() -> FetchRequest {
        FetchRequest {
            title: "Song".to_string(),
            artist: "Band".to_string(),
            url: "https://open.spotify.com/track/abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unavailable_without_base_url() {
        assert!(!strategy("").is_available().await);
        assert!(!strategy(" / ").is_available().await);
        assert!(strategy("https://api.local/").is_available().await);
    }

    #[tokio::test]
    async fn test_successful_download_written() {
        let mut server = mockito::Server::new_async().await;
        let mut body = b"ID3\x04".to_vec();
        body.resize(20_000, 0);
        let mock = server
            .mock("POST", "/api/download")
            .match_body(mockito::Matcher::Json(json!({"url": "https://open.spotify.com/track/abc"})))
            .with_status(200)
            .with_header("content-type", "audio/mpeg")
            .with_body(body)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Band - Song.mp3");
        let ctx = AttemptContext::new(0, 2, CancellationToken::new());

        let bytes = strategy(&server.url()).fetch(&request(), &dest, &ctx).await.unwrap();
        assert_eq!(bytes, 20_000);
        assert!(dest.exists());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/download")
            .with_status(429)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.mp3");
        let s = strategy(&server.url());
        let ctx = AttemptContext::new(0, 2, CancellationToken::new());

        let err = s.fetch(&request(), &dest, &ctx).await.unwrap_err();
        assert!(matches!(err, StrategyError::RateLimited(_)));
        assert_eq!(s.governor.failure_count(), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_error_page_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/api/download")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html>".repeat(1_000))
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.mp3");
        let ctx = AttemptContext::new(0, 2, CancellationToken::new());

        let err = strategy(&server.url()).fetch(&request(), &dest, &ctx).await.unwrap_err();
        assert!(matches!(err, StrategyError::CorruptArtifact(_)));
        assert!(!dest.exists());
    }
}
