//! Remote playlist listing
//!
//! `GET {base_url}/api/song-details?url=<playlist url>` answers with
//! `{"title": ..., "songs": [...]}`. Song entries are loosely typed and are
//! normalized into [`TrackDescriptor`]s on arrival.

use async_trait::async_trait;
use plsync_common::config::ListingConfig;
use plsync_common::models::{ingest_tracks, RawTrack};
use plsync_common::TrackDescriptor;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rate_governor::RateGovernor;
use crate::retry::{sleep_or_cancel, Backoff};
use crate::USER_AGENT;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Listing API error {0}")]
    Api(u16),

    #[error("Rate limited")]
    RateLimited,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Playlist listing has no songs")]
    Empty,

    #[error("Cancelled")]
    Cancelled,
}

impl ListingError {
    fn is_retryable(&self) -> bool {
        match self {
            ListingError::Network(_) | ListingError::RateLimited => true,
            ListingError::Api(status) => *status >= 500,
            _ => false,
        }
    }
}

/// Songs of a remote playlist, already normalized
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlaylist {
    pub title: Option<String>,
    pub songs: Vec<TrackDescriptor>,
}

impl RemotePlaylist {
    /// Name to use when the caller did not pick one
    pub fn suggested_name(&self) -> String {
        self.title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Playlist with {} songs", self.songs.len()))
    }
}

#[derive(Debug, Deserialize)]
struct SongDetailsResponse {
    #[serde(default)]
    title: Option<serde_json::Value>,
    songs: Option<Vec<RawTrack>>,
}

#[async_trait]
pub trait RemoteListing: Send + Sync {
    async fn fetch(&self, playlist_url: &str, cancel: &CancellationToken) -> Result<RemotePlaylist, ListingError>;
}

pub struct HttpListingClient {
    base_url: String,
    http_client: reqwest::Client,
    governor: Arc<RateGovernor>,
    max_attempts: u32,
    backoff: Backoff,
}

impl HttpListingClient {
    pub fn new(
        config: &ListingConfig,
        governor: Arc<RateGovernor>,
        backoff: Backoff,
    ) -> Result<Self, ListingError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ListingError::Network(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client,
            governor,
            max_attempts: config.max_attempts.max(1),
            backoff,
        })
    }

    async fn fetch_once(&self, playlist_url: &str) -> Result<RemotePlaylist, ListingError> {
        let endpoint = format!("{}/api/song-details", self.base_url);
        debug!(endpoint = %endpoint, playlist_url = %playlist_url, "Fetching playlist details");

        let response = self
            .http_client
            .get(&endpoint)
            .query(&[("url", playlist_url)])
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .send()
            .await
            .map_err(|e| ListingError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ListingError::RateLimited);
        }
        if !status.is_success() {
            return Err(ListingError::Api(status.as_u16()));
        }

        let details: SongDetailsResponse = response
            .json()
            .await
            .map_err(|e| ListingError::Parse(e.to_string()))?;

        let raw_songs = details.songs.ok_or(ListingError::Empty)?;
        let songs = ingest_tracks(raw_songs);
        if songs.is_empty() {
            return Err(ListingError::Empty);
        }

        let title = details.title.and_then(|value| match value {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });

        Ok(RemotePlaylist { title, songs })
    }
}

#[async_trait]
impl RemoteListing for HttpListingClient {
    async fn fetch(&self, playlist_url: &str, cancel: &CancellationToken) -> Result<RemotePlaylist, ListingError> {
        let mut attempt = 0;
        loop {
            if !self.governor.wait(cancel).await {
                return Err(ListingError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ListingError::Cancelled),
                result = self.fetch_once(playlist_url) => result,
            };

            match result {
                Ok(playlist) => {
                    self.governor.record_success();
                    info!(
                        playlist_url = %playlist_url,
                        songs = playlist.songs.len(),
                        "Retrieved playlist details"
                    );
                    return Ok(playlist);
                }
                Err(e) => {
                    match &e {
                        ListingError::RateLimited => self.governor.record_rate_limited(),
                        _ if e.is_retryable() => self.governor.record_failure(),
                        _ => {}
                    }

                    attempt += 1;
                    if !e.is_retryable() || attempt >= self.max_attempts {
                        warn!(
                            playlist_url = %playlist_url,
                            attempts = attempt,
                            "Failed to get playlist details: {}",
                            e
                        );
                        return Err(e);
                    }

                    debug!(attempt, "Listing request failed, retrying: {}", e);
                    if !sleep_or_cancel(self.backoff.delay(attempt - 1), cancel).await {
                        return Err(ListingError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plsync_common::config::GovernorConfig;

    fn client(base_url: &str) -> HttpListingClient {
        let config = ListingConfig {
            base_url: base_url.to_string(),
            timeout_secs: 5,
            max_attempts: 3,
        };
        let governor = Arc::new(RateGovernor::new(
            "listing",
            GovernorConfig {
                base_interval_ms: 0,
                ..GovernorConfig::default()
            },
        ));
        HttpListingClient::new(&config, governor, Backoff::immediate()).unwrap()
    }

    #[tokio::test]
    async fn test_listing_normalized() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/song-details")
            .match_query(mockito::Matcher::UrlEncoded(
                "url".into(),
                "https://open.spotify.com/playlist/pl1".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"title": "Road Trip", "songs": [
                    {"title": "A", "artist": "X", "url": "https://open.spotify.com/track/a", "duration": 215000},
                    {"title": "no url"},
                    {"name": 42, "artists": ["Y", "Z"], "url": "https://open.spotify.com/track/b", "duration": "3:05"}
                ]}"#,
            )
            .create_async()
            .await;

        let playlist = client(&server.url())
            .fetch("https://open.spotify.com/playlist/pl1", &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(playlist.suggested_name(), "Road Trip");
        assert_eq!(playlist.songs.len(), 2);
        assert_eq!(playlist.songs[0].duration(), "3:35");
        assert_eq!(playlist.songs[1].title(), "42");
        assert_eq!(playlist.songs[1].artist(), "Y, Z");
    }

    #[tokio::test]
    async fn test_server_errors_retried_until_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/song-details")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = client(&server.url())
            .fetch("https://open.spotify.com/playlist/pl1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ListingError::Api(503)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/song-details")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url())
            .fetch("https://open.spotify.com/playlist/x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ListingError::Api(404)));
        mock.assert_async().await;
    }
}
