//! Exposes the command line application.
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use url::Url;
use webimage_service::caching::{CacheKey, CleanupStats, DiskCache};
use webimage_service::config::Config;
use webimage_service::decoder::RawDecoder;
use webimage_service::engine::Engine;
use webimage_service::metrics;
use webimage_service::pool::NetworkClass;
use webimage_service::types::{Listener, Outcome, Request};

use crate::logging;

/// Loads remote images through a two-tier cache.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load images through the cache and report the outcome for each URL.
    Fetch {
        /// The images to load.
        #[arg(required = true)]
        urls: Vec<Url>,

        /// Ignore cached copies and download again.
        #[arg(long)]
        force_refresh: bool,

        /// Size the download pool for this network class.
        #[arg(long, value_name = "CLASS")]
        network_class: Option<NetworkClass>,
    },

    /// Remove old entries from the disk cache.
    ///
    /// Without arguments, entries older than the configured `max_age` are removed.
    Cleanup {
        /// Remove entries that have not been used for longer than this.
        #[arg(long, value_parser = humantime::parse_duration, conflicts_with = "all")]
        max_age: Option<Duration>,

        /// Remove every entry.
        #[arg(long)]
        all: bool,
    },

    /// Show whether images are cached on disk and how old their entries are.
    Status {
        #[arg(required = true)]
        urls: Vec<Url>,
    },
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();

        if let Some(hostname_tag) = config.metrics.hostname_tag.clone() {
            if tags.contains_key(&hostname_tag) {
                tracing::warn!(
                    "tag {} defined both as hostname tag and as a custom tag",
                    hostname_tag
                );
            }
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(hostname_tag, hostname);
            } else {
                tracing::error!("could not read host name");
            }
        };

        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)?;
    }

    match cli.command {
        Command::Fetch {
            urls,
            force_refresh,
            network_class,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("webimage")
                .enable_all()
                .build()
                .context("failed to create tokio runtime")?;
            runtime.block_on(fetch(&config, urls, force_refresh, network_class))
        }
        Command::Cleanup { max_age, all } => {
            let max_age = match (all, max_age) {
                (true, _) => Duration::ZERO,
                (false, Some(max_age)) => max_age,
                (false, None) => config.caches.max_age,
            };
            cleanup(&config, max_age)
        }
        Command::Status { urls } => status(&config, &urls),
    }
}

async fn fetch(
    config: &Config,
    urls: Vec<Url>,
    force_refresh: bool,
    network_class: Option<NetworkClass>,
) -> Result<()> {
    let engine = Engine::with_http(config, RawDecoder)?;
    if let Some(network_class) = network_class {
        engine.on_network_class_changed(network_class);
    }

    let pending: Vec<_> = urls
        .into_iter()
        .map(|url| {
            let (listener, receiver) = Listener::channel();
            let request = Request::new(url.clone()).with_force_refresh(force_refresh);
            engine.load(request, listener);
            (url, receiver)
        })
        .collect();

    let total = pending.len();
    let mut failed = 0;
    for (url, mut receiver) in pending {
        match receiver.recv().await {
            Some(Outcome::Loaded(response)) => {
                println!("{url}: loaded {} bytes", response.payload.len());
            }
            Some(Outcome::Error(error)) => {
                failed += 1;
                println!("{url}: {error}");
            }
            Some(Outcome::Cancelled) | None => {
                failed += 1;
                println!("{url}: cancelled");
            }
        }
    }

    engine.shutdown().await;

    if failed > 0 {
        bail!("{failed} of {total} images failed to load");
    }
    Ok(())
}

fn cleanup(config: &Config, max_age: Duration) -> Result<()> {
    let cache = DiskCache::from_config(config).context("failed to open disk cache")?;
    cache.clear_tmp().context("failed to clear temporary files")?;

    let CleanupStats {
        removed_files,
        removed_bytes,
        retained_files,
        retained_bytes,
    } = cache
        .evict_older_than(max_age)
        .context("failed to clean up disk cache")?;

    println!("removed {removed_files} files ({removed_bytes} bytes)");
    println!("retained {retained_files} files ({retained_bytes} bytes)");
    Ok(())
}

fn status(config: &Config, urls: &[Url]) -> Result<()> {
    let cache = DiskCache::from_config(config).context("failed to open disk cache")?;

    for url in urls {
        let key = CacheKey::from_url(url);
        let age = cache
            .age(&key)
            .with_context(|| format!("failed to inspect {}", cache.path(&key).display()))?;

        match age {
            Some(age) => {
                let age = Duration::from_secs(age.as_secs());
                let stale = if age > config.caches.recheck_age {
                    ", due for revalidation"
                } else {
                    ""
                };
                println!(
                    "{url}: cached {} ago{stale}",
                    humantime::format_duration(age)
                );
            }
            None => println!("{url}: not cached"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_cleanup() {
        let cli = Cli::try_parse_from(["webimage", "cleanup", "--max-age", "2h"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Cleanup { max_age: Some(max_age), all: false }
                if max_age == Duration::from_secs(7200)
        ));

        let cli = Cli::try_parse_from(["webimage", "-c", "cfg.yml", "cleanup", "--all"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("cfg.yml")));
        assert!(matches!(cli.command, Command::Cleanup { all: true, .. }));

        assert!(Cli::try_parse_from(["webimage", "cleanup", "--all", "--max-age", "1h"]).is_err());
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "webimage",
            "fetch",
            "--network-class",
            "unmetered-fast",
            "https://example.com/cat.png",
        ])
        .unwrap();

        let Command::Fetch {
            urls,
            force_refresh,
            network_class,
        } = cli.command
        else {
            panic!("expected fetch command");
        };
        assert_eq!(urls.len(), 1);
        assert!(!force_refresh);
        assert_eq!(network_class, Some(NetworkClass::UnmeteredFast));

        assert!(Cli::try_parse_from(["webimage", "fetch"]).is_err());
        assert!(Cli::try_parse_from(["webimage", "fetch", "not a url"]).is_err());
    }
}
