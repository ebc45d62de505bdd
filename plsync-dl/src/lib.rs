//! plsync-dl library
//!
//! Acquisition pipeline for linked playlists:
//! - Per-endpoint rate governors and a rotating proxy pool
//! - Pluggable acquisition strategies run by the download orchestrator
//! - Integrity verification of downloaded files
//! - Reconciliation of remote listings against the catalog
//! - Playlist-level operations ([`sync::SyncManager`])

pub mod context;
pub mod error;
pub mod integrity;
pub mod listing;
pub mod orchestrator;
pub mod payload;
pub mod proxy_pool;
pub mod rate_governor;
pub mod reconciler;
pub mod retry;
pub mod strategy;
pub mod sync;

pub use context::AppContext;
pub use error::{Result, SyncError};
pub use orchestrator::{DownloadOrchestrator, DownloadOutcome};
pub use sync::SyncManager;

/// User agent sent on every outgoing request
pub const USER_AGENT: &str = concat!("plsync/", env!("CARGO_PKG_VERSION"));
