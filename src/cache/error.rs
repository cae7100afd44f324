use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a storage tier.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Writing a new object failed; nothing was left behind under the final locator.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The upstream body ended with a different length than it declared.
    #[error("content length mismatch: declared {declared} bytes, received {received}")]
    LengthMismatch { declared: u64, received: u64 },
    /// Reading the upstream body failed part way through.
    #[error("failed to read content stream: {0}")]
    Stream(#[source] io::Error),
    /// The backing object of a locator no longer exists.
    #[error("stored object {0} is missing")]
    Missing(PathBuf),
    /// The backing object exists but is shorter or longer than recorded.
    #[error("stored object {path} has {actual} bytes, expected {expected}")]
    Truncated {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    /// Whether the error came from the write side of a tier.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StorageError::Write { .. } | StorageError::LengthMismatch { .. } | StorageError::Stream(_)
        )
    }
}

/// Errors surfaced by the cache engine to the request dispatcher.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is not an acceptable absolute http(s) URL.
    #[error("invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },
    /// The upstream answered with a non-success status or the transport failed.
    #[error("fetching {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },
    #[error("storing {key} failed: {source}")]
    StorageWrite {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error("reading {key} failed: {source}")]
    StorageRead {
        key: String,
        #[source]
        source: StorageError,
    },
    /// The index said `Ready` but the tier could not produce the bytes, repeatedly.
    #[error("cache index and storage disagree about {key}: {source}")]
    ConsistencyAnomaly {
        key: String,
        #[source]
        source: StorageError,
    },
    /// The fetch this request waited on failed and the entry was rolled back.
    #[error("{0} is not cached: the fetch it waited on did not complete")]
    NotCached(String),
    #[error("failed to open cache root {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    pub fn fetch_failed(url: &str, reason: impl ToString) -> Self {
        CacheError::FetchFailed {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure originates upstream rather than inside the cache.
    pub fn is_upstream(&self) -> bool {
        matches!(self, CacheError::FetchFailed { .. })
    }
}
