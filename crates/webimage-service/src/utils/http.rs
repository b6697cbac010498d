use std::time::Duration;

use reqwest::{header, redirect};

use crate::config::DownloadConfig;

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * Every request carries the configured `User-Agent`.
/// * At most `max_redirects` redirects are followed, further ones fail the request.
/// * Responses are transparently decompressed.
pub fn create_client(config: &DownloadConfig) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    if let Ok(user_agent) = header::HeaderValue::from_str(&config.user_agent) {
        headers.insert(header::USER_AGENT, user_agent);
    } else {
        tracing::warn!(user_agent = config.user_agent, "Ignoring invalid user agent");
    }

    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(config.max_redirects))
        .build()
}
