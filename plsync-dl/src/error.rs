//! Error types for playlist-level operations

use thiserror::Error;

use crate::listing::ListingError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Catalog, settings, filesystem or config failure
    #[error(transparent)]
    Common(#[from] plsync_common::Error),

    /// Remote listing could not be retrieved
    #[error("Listing error: {0}")]
    Listing(#[from] ListingError),

    #[error("Playlist not found: {0}")]
    NotFound(String),

    #[error("Playlist already linked: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Common(plsync_common::Error::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
