//! Playlist operations end to end, with a scripted listing and strategy

use async_trait::async_trait;
use plsync_common::config::{GovernorConfig, IntegrityConfig, ListingConfig};
use plsync_common::{paths, CatalogStore, SettingsStore, TrackDescriptor};
use plsync_dl::integrity::IntegrityVerifier;
use plsync_dl::listing::{HttpListingClient, ListingError, RemoteListing, RemotePlaylist};
use plsync_dl::orchestrator::{DownloadOrchestrator, RetryPolicy};
use plsync_dl::rate_governor::RateGovernor;
use plsync_dl::retry::Backoff;
use plsync_dl::strategy::{AcquisitionStrategy, AttemptContext, FetchRequest, StrategyError};
use plsync_dl::{SyncError, SyncManager};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const PLAYLIST_URL: &str = "https://open.spotify.com/playlist/road";

struct FakeListing {
    playlist: Mutex<RemotePlaylist>,
}

impl FakeListing {
    fn set_songs(&self, songs: Vec<TrackDescriptor>) {
        self.playlist.lock().unwrap().songs = songs;
    }
}

#[async_trait]
impl RemoteListing for FakeListing {
    async fn fetch(&self, _: &str, _: &CancellationToken) -> Result<RemotePlaylist, ListingError> {
        Ok(self.playlist.lock().unwrap().clone())
    }
}

/// Writes a plausible MP3 for every URL not marked as failing
struct FakeStrategy {
    failing: Mutex<HashSet<String>>,
}

impl FakeStrategy {
    fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }
}

#[async_trait]
impl AcquisitionStrategy for FakeStrategy {
    fn id(&self) -> &str {
        "direct-api"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        dest: &Path,
        _: &AttemptContext,
    ) -> Result<u64, StrategyError> {
        if self.failing.lock().unwrap().contains(&request.url) {
            return Err(StrategyError::Unavailable("not found upstream".to_string()));
        }
        write_audio(dest, 300_000);
        Ok(300_000)
    }
}

fn write_audio(path: &Path, len: usize) {
    let mut body = b"ID3".to_vec();
    body.resize(len, 0);
    std::fs::write(path, body).unwrap();
}

fn song(id: &str) -> TrackDescriptor {
    TrackDescriptor::new(
        format!("Song {}", id),
        "Band",
        format!("https://open.spotify.com/track/{}", id),
        Some(180),
    )
    .unwrap()
}

struct Harness {
    _temp: TempDir,
    root: PathBuf,
    music_dir: PathBuf,
    listing: Arc<FakeListing>,
    strategy: Arc<FakeStrategy>,
    settings: Arc<SettingsStore>,
    catalog: Arc<CatalogStore>,
    sync: SyncManager,
}

impl Harness {
    fn new(songs: Vec<TrackDescriptor>) -> Self {
        let listing = Arc::new(FakeListing {
            playlist: Mutex::new(RemotePlaylist {
                title: Some("Road Trip".to_string()),
                songs,
            }),
        });
        Self::with_listing(listing.clone(), listing)
    }

    fn with_listing(fake: Arc<FakeListing>, listing: Arc<dyn RemoteListing>) -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let music_dir = root.join("music");
        std::fs::create_dir_all(&music_dir).unwrap();

        let strategy = Arc::new(FakeStrategy {
            failing: Mutex::new(HashSet::new()),
        });
        let orchestrator = Arc::new(DownloadOrchestrator::new(
            vec![Arc::clone(&strategy) as Arc<dyn AcquisitionStrategy>],
            RetryPolicy {
                attempts_per_strategy: 1,
                proxy_after_attempt: 1,
                backoff: Backoff::immediate(),
            },
        ));
        let catalog = Arc::new(CatalogStore::new(root.join("playlist_db.json")));
        let settings = Arc::new(SettingsStore::new(root.join("settings.json")));
        let verifier = Arc::new(IntegrityVerifier::new(IntegrityConfig::default(), None));

        let sync = SyncManager::new(
            Arc::clone(&catalog),
            Arc::clone(&settings),
            listing,
            orchestrator,
            verifier,
            music_dir.clone(),
        );

        Self {
            _temp: temp,
            root,
            music_dir,
            listing: fake,
            strategy,
            settings,
            catalog,
            sync,
        }
    }

    fn file(&self, track: &TrackDescriptor) -> PathBuf {
        paths::track_file_path(&self.music_dir.join("Road Trip"), track)
    }

    fn songs(&self, id: &str) -> Vec<TrackDescriptor> {
        self.catalog.get(id).unwrap().unwrap().songs
    }
}

#[tokio::test]
async fn test_link_records_only_verified_songs() {
    let h = Harness::new(vec![song("s1"), song("s2"), song("s3")]);
    h.strategy.fail(song("s2").url());

    let linked = h
        .sync
        .link_playlist(PLAYLIST_URL, None, true, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(linked.record.id, "road");
    assert_eq!(linked.record.name, "Road Trip");
    let batch = linked.batch.unwrap();
    assert_eq!(batch.downloaded.len(), 2);
    assert_eq!(batch.failed.len(), 1);
    assert_eq!(batch.failed[0].name, song("s2").display_name());

    assert_eq!(h.songs("road"), vec![song("s1"), song("s3")]);
    assert!(h.file(&song("s1")).is_file());
    assert!(!h.file(&song("s2")).exists());
}

#[tokio::test]
async fn test_link_twice_rejected() {
    let h = Harness::new(vec![song("s1")]);
    let cancel = CancellationToken::new();
    h.sync.link_playlist(PLAYLIST_URL, None, false, &cancel).await.unwrap();

    let err = h
        .sync
        .link_playlist(PLAYLIST_URL, Some("Other".to_string()), false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::AlreadyExists(id) if id == "road"));
}

#[tokio::test]
async fn test_update_drops_ghosts_and_downloads_new() {
    let h = Harness::new(vec![song("s1"), song("s2")]);
    let cancel = CancellationToken::new();
    h.sync.link_playlist(PLAYLIST_URL, None, true, &cancel).await.unwrap();

    std::fs::remove_file(h.file(&song("s2"))).unwrap();
    h.listing.set_songs(vec![song("s1"), song("s2"), song("s3")]);

    let report = h.sync.update_playlist("road", true, &cancel).await.unwrap();
    assert_eq!(report.ghosts_pruned, 1);
    assert_eq!(report.new_songs, vec![song("s2"), song("s3")]);
    assert_eq!(report.batch.unwrap().downloaded.len(), 2);

    assert_eq!(h.songs("road"), vec![song("s1"), song("s2"), song("s3")]);
    for s in ["s1", "s2", "s3"] {
        assert!(h.file(&song(s)).is_file());
    }
}

#[tokio::test]
async fn test_update_without_download_only_reports() {
    let h = Harness::new(vec![song("s1")]);
    let cancel = CancellationToken::new();
    h.sync.link_playlist(PLAYLIST_URL, None, true, &cancel).await.unwrap();

    h.listing.set_songs(vec![song("s1"), song("s2")]);
    let report = h.sync.update_playlist("road", false, &cancel).await.unwrap();

    assert_eq!(report.new_songs, vec![song("s2")]);
    assert!(report.batch.is_none());
    assert_eq!(h.songs("road"), vec![song("s1")]);
    assert!(!h.file(&song("s2")).exists());
}

#[tokio::test]
async fn test_sync_all_follows_auto_download_and_skips_custom() {
    let h = Harness::new(vec![song("s1")]);
    let cancel = CancellationToken::new();
    h.sync.link_playlist(PLAYLIST_URL, None, false, &cancel).await.unwrap();
    h.sync.create_custom("Mine").await.unwrap();

    let summary = h.sync.sync_all(&cancel).await.unwrap();
    assert_eq!(summary.playlists.len(), 1);
    assert_eq!(summary.new_song_count(), 1);
    assert!(h.songs("road").is_empty());
    let first_sync = h.settings.load().unwrap().last_sync.unwrap();

    h.settings.update(|s| s.auto_download_new = true).unwrap();
    let summary = h.sync.sync_all(&cancel).await.unwrap();
    assert!(summary.errors.is_empty());
    assert_eq!(h.songs("road"), vec![song("s1")]);
    assert!(h.settings.load().unwrap().last_sync.unwrap() >= first_sync);
}

#[tokio::test]
async fn test_fix_replaces_corrupted_and_drops_unrecoverable() {
    let h = Harness::new(vec![song("s1"), song("s2"), song("s3")]);
    let cancel = CancellationToken::new();
    h.sync.link_playlist(PLAYLIST_URL, None, true, &cancel).await.unwrap();

    std::fs::write(h.file(&song("s1")), b"<html>error</html>").unwrap();
    std::fs::remove_file(h.file(&song("s2"))).unwrap();
    h.strategy.fail(song("s2").url());

    let report = h.sync.check_integrity("road").await.unwrap();
    assert_eq!(report.corrupted.len(), 1);
    assert_eq!(report.missing, vec![song("s2")]);

    let fix = h.sync.fix_playlist("road", &cancel).await.unwrap();
    assert_eq!(fix.deleted_corrupted, 1);
    assert_eq!(fix.fixed, vec![song("s1").display_name()]);
    assert_eq!(fix.removed, vec![song("s2").display_name()]);

    assert_eq!(h.songs("road"), vec![song("s1"), song("s3")]);
    assert!(h.sync.check_integrity("road").await.unwrap().is_healthy());
}

#[tokio::test]
async fn test_delete_song_and_playlist() {
    let h = Harness::new(vec![song("s1"), song("s2")]);
    let cancel = CancellationToken::new();
    h.sync.link_playlist(PLAYLIST_URL, None, true, &cancel).await.unwrap();

    let removed = h.sync.delete_song("road", 0).await.unwrap();
    assert_eq!(removed, song("s1"));
    assert!(!h.file(&song("s1")).exists());
    assert_eq!(h.songs("road"), vec![song("s2")]);

    assert!(matches!(
        h.sync.delete_song("road", 5).await,
        Err(SyncError::InvalidInput(_))
    ));

    h.sync.delete_playlist("road").await.unwrap();
    assert!(!h.music_dir.join("Road Trip").exists());
    assert!(h.music_dir.exists());
    assert!(h.catalog.get("road").unwrap().is_none());
    assert!(matches!(
        h.sync.delete_playlist("road").await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_same_named_playlists_get_separate_dirs() {
    let h = Harness::new(vec![]);
    let cancel = CancellationToken::new();
    let a = h.sync.create_custom("Mix").await.unwrap();
    let b = h.sync.create_custom("Mix").await.unwrap();
    assert_eq!(a.path, h.music_dir.join("Mix"));
    assert_eq!(b.path, h.music_dir.join("Mix (2)"));

    h.sync.add_track(&b.id, song("x"), &cancel).await.unwrap();
    h.sync.delete_playlist(&a.id).await.unwrap();

    let report = h.sync.check_integrity(&b.id).await.unwrap();
    assert_eq!(report.valid.len(), 1);
    assert!(report.missing.is_empty());
}

#[tokio::test]
async fn test_delete_keeps_files_of_playlist_sharing_dir() {
    let h = Harness::new(vec![]);
    let cancel = CancellationToken::new();
    let a = h.sync.create_custom("Mix").await.unwrap();
    let b = h.sync.create_custom("Other").await.unwrap();
    h.catalog
        .update(|catalog| {
            if let Some(r) = catalog.get_mut(&b.id) {
                r.path = a.path.clone();
            }
        })
        .unwrap();

    h.sync.add_track(&a.id, song("x"), &cancel).await.unwrap();
    h.sync.add_track(&b.id, song("y"), &cancel).await.unwrap();
    h.sync.delete_playlist(&a.id).await.unwrap();

    assert!(!paths::track_file_path(&a.path, &song("x")).exists());
    assert!(paths::track_file_path(&a.path, &song("y")).is_file());
    assert!(h.catalog.get(&a.id).unwrap().is_none());
    assert_eq!(h.songs(&b.id), vec![song("y")]);
}

#[tokio::test]
async fn test_cancelled_batch_keeps_catalog_consistent() {
    let h = Harness::new(vec![song("s1"), song("s2")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    h.sync
        .link_playlist(PLAYLIST_URL, None, true, &CancellationToken::new())
        .await
        .unwrap();
    std::fs::remove_file(h.file(&song("s1"))).unwrap();
    std::fs::remove_file(h.file(&song("s2"))).unwrap();

    let report = h.sync.update_playlist("road", true, &cancel).await.unwrap();
    let batch = report.batch.unwrap();
    assert!(batch.cancelled);
    assert!(batch.downloaded.is_empty());
    assert!(h.songs("road").is_empty());
}

#[tokio::test]
async fn test_add_track_to_custom_playlist() {
    let h = Harness::new(vec![]);
    let cancel = CancellationToken::new();
    let record = h.sync.create_custom("Mine").await.unwrap();
    assert!(record.is_custom);
    assert!(h.music_dir.join("Mine").is_dir());

    let batch = h.sync.add_track(&record.id, song("x"), &cancel).await.unwrap();
    assert_eq!(batch.downloaded, vec![song("x").display_name()]);
    assert_eq!(h.songs(&record.id), vec![song("x")]);

    assert!(matches!(
        h.sync.add_track(&record.id, song("x"), &cancel).await,
        Err(SyncError::InvalidInput(_))
    ));
    assert!(matches!(
        h.sync.update_playlist(&record.id, true, &cancel).await,
        Err(SyncError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_existing_valid_file_adopted_without_download() {
    let h = Harness::new(vec![song("s1")]);
    let dir = h.music_dir.join("Road Trip");
    std::fs::create_dir_all(&dir).unwrap();
    write_audio(&h.file(&song("s1")), 300_000);
    h.strategy.fail(song("s1").url());

    let linked = h
        .sync
        .link_playlist(PLAYLIST_URL, None, true, &CancellationToken::new())
        .await
        .unwrap();

    let batch = linked.batch.unwrap();
    assert_eq!(batch.adopted, vec![song("s1").display_name()]);
    assert!(batch.failed.is_empty());
    assert_eq!(h.songs("road"), vec![song("s1")]);
}

#[tokio::test]
async fn test_link_through_http_listing() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/song-details")
        .match_query(mockito::Matcher::UrlEncoded("url".into(), PLAYLIST_URL.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"title": "Road Trip", "songs": [
                {"title": "Song s1", "artist": "Band", "url": "https://open.spotify.com/track/s1", "duration": "3:00"},
                {"title": "Song s2", "artists": [{"name": "Band"}], "url": "https://open.spotify.com/track/s2", "duration": 180000}
            ]}"#,
        )
        .create_async()
        .await;

    let listing = HttpListingClient::new(
        &ListingConfig {
            base_url: server.url(),
            timeout_secs: 5,
            max_attempts: 1,
        },
        Arc::new(RateGovernor::new(
            "listing",
            GovernorConfig {
                base_interval_ms: 0,
                ..GovernorConfig::default()
            },
        )),
        Backoff::immediate(),
    )
    .unwrap();

    let fake = Arc::new(FakeListing {
        playlist: Mutex::new(RemotePlaylist {
            title: None,
            songs: vec![],
        }),
    });
    let h = Harness::with_listing(fake, Arc::new(listing));

    let linked = h
        .sync
        .link_playlist(PLAYLIST_URL, None, true, &CancellationToken::new())
        .await
        .unwrap();
    mock.assert_async().await;

    assert_eq!(linked.record.name, "Road Trip");
    assert_eq!(h.songs("road"), vec![song("s1"), song("s2")]);
    assert!(h.root.join("playlist_db.json").is_file());
}
