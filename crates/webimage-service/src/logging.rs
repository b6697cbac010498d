use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Builds the filter for the configured `level`.
///
/// A `RUST_LOG` environment variable takes precedence. Otherwise the engine crates log at `level`
/// and the noisy HTTP stack only reports warnings.
pub fn env_filter(level: LevelFilter) -> EnvFilter {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(format!(
            "{level},webimage={level},webimage_service={level},hyper=warn,reqwest=warn"
        )),
    }
}

/// Installs a subscriber writing one JSON object per event to `make_writer`.
///
/// Events are also forwarded to Sentry as breadcrumbs and errors.
pub fn init_json_logging<W>(env_filter: EnvFilter, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}
