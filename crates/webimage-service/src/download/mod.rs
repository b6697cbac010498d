//! Retrieval of remote resources.
//!
//! The engine talks to the network only through the [`Fetcher`] trait, which allows swapping the
//! real [`HttpFetcher`] for scripted fakes in tests.

use std::time::SystemTime;

use futures::future::BoxFuture;
use tokio::fs::File;
use url::Url;

use crate::caching::CacheContents;

mod http;

pub use self::http::HttpFetcher;

/// Network access used by the engine.
pub trait Fetcher: Send + Sync + 'static {
    /// Downloads the resource at `url` into `destination`, returning the number of bytes written.
    ///
    /// The contents of `destination` are discarded when this fails. A response shorter than its
    /// announced length must fail with [`LoadError::TransferFailed`].
    ///
    /// [`LoadError::TransferFailed`]: crate::caching::LoadError::TransferFailed
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a mut File,
    ) -> BoxFuture<'a, CacheContents<u64>>;

    /// Asks the origin until when its copy of `url` stays valid.
    ///
    /// Resolves to `Ok(None)` if the origin did not answer with a usable expiry time, and to an
    /// error if the origin could not be reached at all.
    fn probe_expiry<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Option<SystemTime>>>;
}

impl<F: Fetcher + ?Sized> Fetcher for std::sync::Arc<F> {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a mut File,
    ) -> BoxFuture<'a, CacheContents<u64>> {
        (**self).fetch(url, destination)
    }

    fn probe_expiry<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Option<SystemTime>>> {
        (**self).probe_expiry(url)
    }
}
