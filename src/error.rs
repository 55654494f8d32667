//! Error types for the media-fetch library.

use thiserror::Error;

/// Errors that can occur while setting up or driving the fetch manager.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client construction or request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration could not be parsed or is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The key is not a usable relative path.
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A transfer for `key` reached a terminal failure.
    #[error("Fetch of {key} failed: {source}")]
    Fetch {
        /// Key of the failed transfer.
        key: String,
        /// Terminal outcome reported by the worker.
        source: FetchError,
    },
}

/// Terminal outcome of a single key's transfer.
///
/// This type is `Clone` so a single outcome can be handed to every observer of
/// the in-flight key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No connectivity at request time. Never retried, no temp file created.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// Connection dropped, refused or the body ended early.
    #[error("connection error: {0}")]
    Connection(String),

    /// The per-attempt timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// The origin answered with a status we cannot use.
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    /// Disk write, flush or rename failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The request was cancelled by key or token.
    #[error("cancelled")]
    Cancelled,

    /// A batch stopped because one of its keys failed.
    #[error("batch failed on {key}: {source}")]
    BatchPartialFailure {
        /// First key that failed.
        key: String,
        /// Why it failed.
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Returns true for the classes the worker retries with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::UnexpectedStatus(status.as_u16())
        } else if e.is_builder() {
            // Malformed URL or header: retrying cannot help.
            Self::Io(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A specialized `Result` type for media-fetch operations.
pub type Result<T> = std::result::Result<T, Error>;
