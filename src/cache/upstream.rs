use std::future::Future;
use tokio::io::AsyncRead;

use super::error::CacheError;

/// Body of an upstream response, consumed once by the storage tier.
pub type UpstreamBody = Box<dyn AsyncRead + Send + Unpin>;

/// A successful upstream response.
pub struct Fetched {
    pub body: UpstreamBody,
    /// Declared length, if the upstream sent one.
    pub content_length: Option<u64>,
}

impl Fetched {
    pub fn new<R>(body: R, content_length: Option<u64>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            body: Box::new(body),
            content_length,
        }
    }
}

/// Retrieves a URL from the origin. Supplied by the dispatcher, which owns
/// transport, proxy and TLS settings; the engine only decides *when* to call it.
pub trait Upstream: Send + Sync {
    /// Returns the body of a successful response, or
    /// [`CacheError::FetchFailed`] for non-success statuses and transport errors.
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Fetched, CacheError>> + Send;
}
