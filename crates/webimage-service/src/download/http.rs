//! Support to download from HTTP origins.

use std::time::{Instant, SystemTime};

use chrono::DateTime;
use futures::future::BoxFuture;
use futures::prelude::*;
use reqwest::{Client, header};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::caching::{CacheContents, LoadError};
use crate::config::DownloadConfig;
use crate::utils::http::create_client;

use super::Fetcher;

/// [`Fetcher`] implementation talking to HTTP origins.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &DownloadConfig) -> reqwest::Result<Self> {
        Ok(Self::new(create_client(config)?))
    }

    async fn download(&self, url: &Url, destination: &mut File) -> CacheContents<u64> {
        tracing::debug!("Fetching image from `{}`", url);
        let start = Instant::now();

        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!("Unexpected status code from `{}`: {}", url, status);
            return Err(LoadError::TransferFailed(status.to_string()));
        }

        let expected_len = response.content_length();
        let mut received = 0u64;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            destination.write_all(&chunk).await?;
        }
        destination.flush().await?;

        if let Some(expected) = expected_len.filter(|expected| *expected != received) {
            tracing::debug!(
                "Short read from `{}`: expected {} bytes, got {}",
                url,
                expected,
                received
            );
            return Err(LoadError::TransferFailed("short read".into()));
        }

        metric!(timer("download.duration") = start.elapsed());
        metric!(time_raw("download.size") = received);

        Ok(received)
    }

    async fn expiry(&self, url: &Url) -> CacheContents<Option<SystemTime>> {
        tracing::debug!("Checking expiry of `{}`", url);

        let response = self.client.head(url.clone()).send().await?;
        if !response.status().is_success() {
            tracing::debug!(
                "Unexpected status code probing `{}`: {}",
                url,
                response.status()
            );
            return Ok(None);
        }

        let expires = response
            .headers()
            .get(header::EXPIRES)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(SystemTime::from);

        Ok(expires)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        destination: &'a mut File,
    ) -> BoxFuture<'a, CacheContents<u64>> {
        self.download(url, destination).boxed()
    }

    fn probe_expiry<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, CacheContents<Option<SystemTime>>> {
        self.expiry(url).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    use crate::test;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::from_config(&DownloadConfig::default()).unwrap()
    }

    async fn fetch_to_string(fetcher: &HttpFetcher, url: &Url) -> CacheContents<String> {
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        let mut destination = File::from_std(tmpfile.reopen().unwrap());

        let len = fetcher.fetch(url, &mut destination).await?;
        let contents = std::fs::read_to_string(tmpfile.path()).unwrap();
        assert_eq!(len, contents.len() as u64);
        Ok(contents)
    }

    #[tokio::test]
    async fn test_fetch() {
        test::setup();

        let server = test::HitCounter::new();
        let url = server.url("images/cat.png");

        let contents = fetch_to_string(&fetcher(), &url).await.unwrap();
        assert_eq!(contents, "image:cat.png");
        assert_eq!(
            server.all_hits(),
            [("GET /images/cat.png".to_owned(), 1)]
        );
    }

    #[tokio::test]
    async fn test_fetch_status_error() {
        test::setup();

        let server = test::HitCounter::new();
        let url = server.url("respond_statuscode/404/cat.png");

        let result = fetch_to_string(&fetcher(), &url).await;
        assert_eq!(result, Err(LoadError::TransferFailed("404 Not Found".into())));
    }

    #[tokio::test]
    async fn test_redirects() {
        test::setup();

        let server = test::HitCounter::new();
        let fetcher = HttpFetcher::from_config(&DownloadConfig {
            max_redirects: 2,
            ..Default::default()
        })
        .unwrap();

        let url = server.url("redirect/redirect/images/cat.png");
        let contents = fetch_to_string(&fetcher, &url).await.unwrap();
        assert_eq!(contents, "image:cat.png");
        assert_eq!(server.accesses(), 3);

        let url = server.url("redirect/redirect/redirect/images/cat.png");
        let result = fetch_to_string(&fetcher, &url).await;
        assert!(matches!(result, Err(LoadError::TransferFailed(_))));
        // the third redirect is never followed
        assert_eq!(server.accesses(), 3);
    }

    #[tokio::test]
    async fn test_short_read() {
        test::setup();

        let server = test::short_read_server();
        let result = fetch_to_string(&fetcher(), &server.url("image.png")).await;

        assert!(matches!(result, Err(LoadError::TransferFailed(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        test::setup();

        let url = {
            let server = test::HitCounter::new();
            server.url("images/cat.png")
        };
        // Give the aborted server a moment to release its socket.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = fetch_to_string(&fetcher(), &url).await;
        assert!(matches!(result, Err(LoadError::TransferFailed(_))));
    }

    #[tokio::test]
    async fn test_probe_expiry() {
        test::setup();

        let server = test::HitCounter::new();
        let fetcher = fetcher();

        let expires = fetcher
            .probe_expiry(&server.url("images/cat.png"))
            .await
            .unwrap()
            .unwrap();
        assert!(expires > SystemTime::now());

        let expires = fetcher
            .probe_expiry(&server.url("expired/cat.png"))
            .await
            .unwrap()
            .unwrap();
        assert!(expires < SystemTime::now());

        let expires = fetcher
            .probe_expiry(&server.url("noexpiry/cat.png"))
            .await
            .unwrap();
        assert_eq!(expires, None);

        let expires = fetcher
            .probe_expiry(&server.url("garbage_expiry/cat.png"))
            .await
            .unwrap();
        assert_eq!(expires, None);

        assert_eq!(
            server.all_hits(),
            [
                ("HEAD /expired/cat.png".to_owned(), 1),
                ("HEAD /garbage_expiry/cat.png".to_owned(), 1),
                ("HEAD /images/cat.png".to_owned(), 1),
                ("HEAD /noexpiry/cat.png".to_owned(), 1),
            ]
        );
    }
}
