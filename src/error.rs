//! Error types for OfflineKit
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by where they come from in the download pipeline:
//!
//! ### Classification
//! - The primary media source is missing or has an unrecognized format.
//!   Fatal to the whole item download; nothing is transferred.
//!
//! ### Transport
//! - Network failures, non-success status codes, empty payloads and
//!   unparseable playlists. Captured per resource operation and aggregated
//!   first-failure-wins by the item operation.
//!
//! ### Filesystem
//! - Directory creation, move, write and removal failures. Same aggregation
//!   path as transport errors.
//!
//! ### Manifest
//! - A required resource (primary media, poster) could not be mapped to a
//!   local path, or the manifest document could not be encoded.
//!
//! ### State misuse
//! - Destructive requests made against an item in the wrong lifecycle state.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias using our OfflineError type
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Main error type for OfflineKit
#[derive(Error, Debug)]
pub enum OfflineError {
    // ===== Classification Errors =====

    /// The primary media source has a file extension we cannot download
    #[error("Unsupported media format '{extension}' for {url}")]
    UnsupportedMediaFormat {
        url: String,
        /// Lowercased path extension, empty if the URL has none
        extension: String,
    },

    /// The item does not reference any media source
    #[error("Item has no media source to download")]
    MissingMediaSource,

    // ===== Transport Errors =====

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Server responded with a non-success status code
    #[error("Server responded with unexpected status code {status_code} for {url}")]
    UnexpectedStatusCode {
        status_code: u16,
        url: String,
    },

    /// The server returned a successful response without any content
    #[error("Downloaded payload is empty: {0}")]
    EmptyPayload(String),

    /// A streaming playlist could not be parsed
    #[error("Invalid playlist: {0}")]
    PlaylistParse(String),

    // ===== File/Storage Errors =====

    /// Generic file I/O error with context
    #[error("File I/O error: {0}")]
    FileIoError(String),

    // ===== Manifest Errors =====

    /// The manifest for a downloaded item could not be created or read
    #[error("Manifest error: {0}")]
    ManifestError(String),

    // ===== State Errors =====

    /// The item is not fully downloaded, so it cannot be removed
    #[error("Item does not exist locally: {0}")]
    ItemNotLocal(String),

    /// No download is in flight for the item
    #[error("Item is not downloading: {0}")]
    NotDownloading(String),

    // ===== Aggregation =====

    /// A resource belonging to an item failed; the first such failure wins
    #[error("Failed to download {role}: {source}")]
    ResourceDownloadFailed {
        role: String,
        #[source]
        source: Arc<OfflineError>,
    },

    // ===== General Errors =====

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is invalid or incomplete
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<url::ParseError> for OfflineError {
    fn from(err: url::ParseError) -> Self {
        OfflineError::InvalidInput(format!("Invalid URL: {}", err))
    }
}

impl OfflineError {
    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        OfflineError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        OfflineError::InternalError(message.into())
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        OfflineError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Classify a failed HTTP exchange
    pub fn transport(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return OfflineError::UnexpectedStatusCode {
                status_code: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        let is_transient = err.is_timeout() || err.is_connect() || err.is_body();
        OfflineError::NetworkError {
            message: err.to_string(),
            is_transient,
        }
    }

    /// Wrap an I/O failure with the path it happened on
    pub fn file_io(action: &str, path: &std::path::Path, err: std::io::Error) -> Self {
        OfflineError::FileIoError(format!("{} {}: {}", action, path.display(), err))
    }

    /// Follow `ResourceDownloadFailed` wrappers down to the error that
    /// actually happened.
    pub fn root_cause(&self) -> &OfflineError {
        match self {
            OfflineError::ResourceDownloadFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if the primary media could not be classified
    pub fn is_classification_error(&self) -> bool {
        matches!(
            self.root_cause(),
            OfflineError::UnsupportedMediaFormat { .. } | OfflineError::MissingMediaSource
        )
    }

    /// Check if error came from the network or the remote server
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self.root_cause(),
            OfflineError::NetworkError { .. }
                | OfflineError::UnexpectedStatusCode { .. }
                | OfflineError::EmptyPayload(_)
                | OfflineError::PlaylistParse(_)
                | OfflineError::ReqwestError(_)
        )
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self.root_cause(),
            OfflineError::FileIoError(_) | OfflineError::IoError(_)
        )
    }

    /// Check if a request was made against an item in the wrong state
    pub fn is_state_error(&self) -> bool {
        matches!(
            self.root_cause(),
            OfflineError::ItemNotLocal(_) | OfflineError::NotDownloading(_)
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self.root_cause() {
            OfflineError::UnsupportedMediaFormat { extension, .. } => {
                format!("This video format ('{}') cannot be saved for offline playback.", extension)
            }
            OfflineError::MissingMediaSource => {
                "This item has no video to download.".to_string()
            }
            OfflineError::UnexpectedStatusCode { status_code: 404, .. } => {
                "The video could not be found on the server.".to_string()
            }
            OfflineError::NetworkError { .. } | OfflineError::ReqwestError(_) => {
                "Download failed due to a network problem. Please try again.".to_string()
            }
            OfflineError::ItemNotLocal(_) => {
                "This item is not downloaded.".to_string()
            }
            OfflineError::Cancelled => "Download was cancelled.".to_string(),
            other => other.to_string(),
        }
    }
}
