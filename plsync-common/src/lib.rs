//! # plsync Common Library
//!
//! Shared code for the plsync crates:
//! - Error taxonomy
//! - Configuration loading and root folder resolution
//! - Track and playlist models (normalized at ingestion)
//! - Filesystem layout and filename sanitization
//! - Durable catalog and settings stores

pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod paths;
pub mod settings;

pub use catalog::{Catalog, CatalogStore};
pub use error::{Error, Result};
pub use models::{PlaylistRecord, SourceKind, TrackDescriptor};
pub use settings::{Settings, SettingsStore};
