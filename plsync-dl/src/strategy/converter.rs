//! Two-stage converter service
//!
//! 1. `POST {api_url}/convert` with `{"url", "query"}` answers with
//!    `{"download_url": ...}` or `{"error": ...}`
//! 2. `GET download_url` returns the audio

use async_trait::async_trait;
use serde::Deserialize;
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

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct ConverterStrategy {
    id: String,
    api_url: String,
    timeout: Duration,
    download_timeout: Duration,
    governor: Arc<RateGovernor>,
    routing: ProxyRouting,
    policy: PayloadPolicy,
}

impl ConverterStrategy {
    pub fn new(
        id: impl Into<String>,
        api_url: &str,
        timeout: Duration,
        download_timeout: Duration,
        governor: Arc<RateGovernor>,
        routing: ProxyRouting,
        policy: PayloadPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            api_url: api_url.trim_end_matches('/').to_string(),
            timeout,
            download_timeout,
            governor,
            routing,
            policy,
        }
    }

    async fn request_conversion(
        &self,
        request: &FetchRequest,
        proxy: Option<&str>,
    ) -> Result<String, StrategyError> {
        let client = build_client(self.timeout, proxy)?;
        let endpoint = format!("{}/convert", self.api_url);

        let response = client
            .post(&endpoint)
            .json(&json!({ "url": request.url, "query": request.query() }))
            .send()
            .await
            .map_err(|e| classify_transport(&e, &self.id))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &self.id));
        }

        let parsed: ConvertResponse = response
            .json()
            .await
            .map_err(|e| StrategyError::Transient(format!("{}: bad convert response: {}", self.id, e)))?;

        match (parsed.download_url, parsed.error) {
            (Some(url), _) if !url.trim().is_empty() => Ok(url),
            (_, Some(error)) => Err(StrategyError::Unavailable(format!("{}: {}", self.id, error))),
            _ => Err(StrategyError::Unavailable(format!("{}: no download link returned", self.id))),
        }
    }

    async fn download(
        &self,
        download_url: &str,
        dest: &Path,
        proxy: Option<&str>,
    ) -> Result<u64, StrategyError> {
        let client = build_client(self.download_timeout, proxy)?;

        debug!(strategy = %self.id, url = %download_url, "Fetching converted file");
        let response = client
            .get(download_url)
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
impl AcquisitionStrategy for ConverterStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_available(&self) -> bool {
        !self.api_url.is_empty()
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
            result = async {
                let link = self.request_conversion(request, proxy.as_deref()).await?;
                self.download(&link, dest, proxy.as_deref()).await
            } => result,
        };

        record_outcome(&self.governor, &result);
        if proxy.is_some() {
            let relay_ok = !matches!(result, Err(StrategyError::Transient(_)));
            self.routing.report(proxy.as_deref(), relay_ok).await;
        }

        if let Ok(bytes) = result {
            info!(strategy = %self.id, bytes, "Downloaded via converter");
        }
        result
    }
}
