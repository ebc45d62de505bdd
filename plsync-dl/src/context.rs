//! Component wiring
//!
//! Builds every long-lived component from a resolved [`TomlConfig`] and root
//! folder. Strategies are registered under their configured ids; the order
//! they run in comes from the persisted settings at download time.

use plsync_common::config::{TomlConfig, CATALOG_FILE, SETTINGS_FILE};
use plsync_common::{CatalogStore, SettingsStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::integrity::{DurationProbe, FfprobeProbe, IntegrityVerifier};
use crate::listing::HttpListingClient;
use crate::orchestrator::{DownloadOrchestrator, RetryPolicy};
use crate::payload::PayloadPolicy;
use crate::proxy_pool::ProxyPool;
use crate::rate_governor::GovernorRegistry;
use crate::retry::Backoff;
use crate::strategy::{
    AcquisitionStrategy, ConverterStrategy, ExternalToolStrategy, HttpApiStrategy, ProxyRouting,
};
use crate::sync::SyncManager;

pub struct AppContext {
    pub config: TomlConfig,
    pub root_folder: PathBuf,
    pub music_dir: PathBuf,
    pub catalog: Arc<CatalogStore>,
    pub settings: Arc<SettingsStore>,
    pub governors: Arc<GovernorRegistry>,
    pub proxy_pool: Option<Arc<ProxyPool>>,
    pub orchestrator: Arc<DownloadOrchestrator>,
    pub sync: Arc<SyncManager>,
}

impl AppContext {
    pub fn build(config: TomlConfig, root_folder: PathBuf) -> Result<Self> {
        let music_dir = config.music_dir(&root_folder);
        std::fs::create_dir_all(&music_dir)?;
        info!("Root folder: {}", root_folder.display());
        info!("Music directory: {}", music_dir.display());

        let catalog = Arc::new(CatalogStore::new(root_folder.join(CATALOG_FILE)));
        let settings = Arc::new(SettingsStore::new(root_folder.join(SETTINGS_FILE)));
        let governors = Arc::new(GovernorRegistry::new(config.governor.clone()));

        let proxy_pool = if config.proxy.enabled {
            let pool = ProxyPool::from_config(config.proxy.clone())
                .map_err(|e| SyncError::Common(plsync_common::Error::Config(e.to_string())))?;
            Some(Arc::new(pool))
        } else {
            debug!("Proxy routing disabled");
            None
        };
        let routing = ProxyRouting::new(proxy_pool.clone());

        let scratch_root = std::env::temp_dir().join("plsync");
        let strategies = build_strategies(&config, &governors, &routing, &scratch_root);
        let orchestrator = Arc::new(DownloadOrchestrator::new(
            strategies,
            RetryPolicy::from_config(&config.download),
        ));
        info!(strategies = ?orchestrator.strategy_ids(), "Acquisition strategies registered");

        let probe: Arc<dyn DurationProbe> = Arc::new(FfprobeProbe::from_config(&config.integrity));
        let verifier = Arc::new(IntegrityVerifier::new(config.integrity.clone(), Some(probe)));

        let listing = Arc::new(HttpListingClient::new(
            &config.listing,
            governors.for_url(&config.listing.base_url),
            Backoff::from_config(&config.download),
        )?);

        let sync = Arc::new(SyncManager::new(
            Arc::clone(&catalog),
            Arc::clone(&settings),
            listing,
            Arc::clone(&orchestrator),
            verifier,
            music_dir.clone(),
        ));

        Ok(Self {
            config,
            root_folder,
            music_dir,
            catalog,
            settings,
            governors,
            proxy_pool,
            orchestrator,
            sync,
        })
    }
}

/// One strategy per configured entry; HTTP strategies share a governor per host
pub fn build_strategies(
    config: &TomlConfig,
    governors: &GovernorRegistry,
    routing: &ProxyRouting,
    scratch_root: &Path,
) -> Vec<Arc<dyn AcquisitionStrategy>> {
    let policy = PayloadPolicy::from_config(&config.download);
    let mut strategies: Vec<Arc<dyn AcquisitionStrategy>> = Vec::new();

    if let Some(api) = &config.strategies.direct_api {
        strategies.push(Arc::new(HttpApiStrategy::new(
            api.id.clone(),
            &api.base_url,
            Duration::from_secs(api.timeout_secs),
            governors.for_url(&api.base_url),
            routing.clone(),
            policy,
        )));
    }

    if let Some(converter) = &config.strategies.converter {
        strategies.push(Arc::new(ConverterStrategy::new(
            converter.id.clone(),
            &converter.api_url,
            Duration::from_secs(converter.timeout_secs),
            Duration::from_secs(converter.download_timeout_secs),
            governors.for_url(&converter.api_url),
            routing.clone(),
            policy,
        )));
    }

    for tool in &config.strategies.tools {
        strategies.push(Arc::new(ExternalToolStrategy::new(
            tool.clone(),
            scratch_root.to_path_buf(),
            routing.clone(),
            policy,
        )));
    }

    strategies
}

#[cfg(test)]
mod tests {
    use super::*;
    use plsync_common::config::ConverterConfig;

    #[test]
    fn test_strategies_registered_by_id() {
        let mut config = TomlConfig::default();
        config.strategies.converter = Some(ConverterConfig {
            api_url: "http://converter.local".to_string(),
            ..ConverterConfig::default()
        });

        let governors = GovernorRegistry::new(config.governor.clone());
        let strategies = build_strategies(
            &config,
            &governors,
            &ProxyRouting::direct(),
            Path::new("/tmp/plsync-test"),
        );

        let ids: Vec<&str> = strategies.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["direct-api", "converter", "spotdl", "yt-dlp"]);
    }

    #[test]
    fn test_build_creates_music_dir() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = TomlConfig::default();
        config.proxy.enabled = false;

        let ctx = AppContext::build(config, temp.path().to_path_buf()).unwrap();
        assert!(ctx.music_dir.is_dir());
        assert!(ctx.proxy_pool.is_none());
        assert_eq!(ctx.catalog.path(), temp.path().join(CATALOG_FILE));
    }
}
