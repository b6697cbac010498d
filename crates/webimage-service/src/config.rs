use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::pool::NetworkClass;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "webimage".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the memory and disk tiers.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Disk entries older than this are served, but revalidated in the background.
    #[serde(with = "humantime_serde")]
    pub recheck_age: Duration,

    /// Maximum age of disk entries removed by [`Engine::evict_disk_expired`].
    ///
    /// [`Engine::evict_disk_expired`]: crate::engine::Engine::evict_disk_expired
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// Capacity of the in-memory tier, in the weight units reported by the decoder.
    ///
    /// For the default decoder this is the number of bytes.
    pub in_memory_capacity: u64,

    /// Memory entries not accessed for this long are dropped.
    #[serde(with = "humantime_serde")]
    pub in_memory_time_to_idle: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            recheck_age: Duration::from_secs(24 * 60 * 60),
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            in_memory_capacity: 64 * 1024 * 1024,
            in_memory_time_to_idle: Some(Duration::from_secs(30 * 60)),
        }
    }
}

/// Configuration of the network fetcher and the download pool.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// The download worker count used on unmetered fast networks.
    pub max_workers: usize,

    /// The network class assumed until the first change notification.
    pub network_class: NetworkClass,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Global timeout for one request.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Redirects followed before a download fails.
    pub max_redirects: usize,

    /// The `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            network_class: NetworkClass::Unknown,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            max_redirects: 5,
            user_agent: format!("webimage/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The root directory of the disk tier and its temporary files.
    pub cache_dir: PathBuf,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Configuration of the cache tiers.
    pub caches: CacheConfig,

    /// Configuration of the network fetcher.
    pub downloads: DownloadConfig,

    /// How long [`Engine::shutdown`](crate::engine::Engine::shutdown) waits for running work
    /// to wind down.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    pub fn cache_dir<P>(&self, dir: P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        self.cache_dir.join(dir)
    }
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> PathBuf {
    env::temp_dir().join("webimage")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfig::default(),
            downloads: DownloadConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches.recheck_age, Duration::from_secs(3600 * 24));
        assert_eq!(cfg.caches.max_age, Duration::from_secs(3600 * 24 * 30));

        // Individual values can be set in reasonable units without affecting the others.
        let yaml = r#"
            caches:
              recheck_age: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.recheck_age, Duration::from_secs(3600));
        assert_eq!(cfg.caches.max_age, CacheConfig::default().max_age);
        assert_eq!(cfg.downloads, DownloadConfig::default());
    }

    #[test]
    fn test_disabling_idle_expiry() {
        let yaml = r#"
            caches:
              in_memory_time_to_idle: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.in_memory_time_to_idle, None);
    }

    #[test]
    fn test_downloads() {
        let yaml = r#"
            cache_dir: /var/cache/webimage
            downloads:
              max_workers: 8
              network_class: metered-fast
              connect_timeout: 0s
              user_agent: test-agent
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.cache_dir("images"),
            PathBuf::from("/var/cache/webimage/images")
        );
        assert_eq!(cfg.downloads.max_workers, 8);
        assert_eq!(cfg.downloads.network_class, NetworkClass::MeteredFast);
        assert_eq!(cfg.downloads.connect_timeout, Duration::from_secs(0));
        assert_eq!(cfg.downloads.user_agent, "test-agent");
        assert_eq!(cfg.downloads.max_redirects, 5);
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
