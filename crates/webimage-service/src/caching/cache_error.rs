use std::error::Error;
use std::io;

use thiserror::Error;

/// An error that happens while loading a resource through one of the cache tiers.
///
/// Cancellation is not an error, see [`Outcome::Cancelled`](crate::types::Outcome::Cancelled).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// A disk cache entry was read that does not exist.
    ///
    /// The engine always checks for presence before reading, so this only surfaces when an entry
    /// is removed between that check and the read.
    #[error("not found")]
    NotFound,
    /// The resource could not be transferred.
    ///
    /// This covers network and file system failures, short reads, and too many redirects.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    /// The resource was transferred successfully, but could not be decoded.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::transfer_error(&err),
        }
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> Self {
        Self::transfer_error(&err)
    }
}

impl LoadError {
    /// Creates a [`TransferFailed`](Self::TransferFailed) from the innermost cause of `error`.
    pub fn transfer_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::TransferFailed(error_string)
    }
}

/// The result of a cache operation.
pub type CacheContents<T = ()> = Result<T, LoadError>;
