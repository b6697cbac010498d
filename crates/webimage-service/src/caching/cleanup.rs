use std::fs::{read_dir, remove_file};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::metric;

use super::DiskCache;
use super::fs::catch_not_found;

/// Statistics about one [`DiskCache::evict_older_than`] sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DiskCache {
    /// Removes every entry whose age exceeds `max_age`.
    ///
    /// Ages are truncated to whole seconds before comparing, so an entry is only removed once it is
    /// at least one full second older than `max_age`, and sub-second parts of `max_age` are
    /// ignored. A `max_age` of zero removes every entry.
    ///
    /// Failing to remove a single file is logged and does not abort the sweep.
    pub fn evict_older_than(&self, max_age: Duration) -> io::Result<CleanupStats> {
        tracing::info!(
            "Evicting cache entries older than {}",
            humantime::format_duration(max_age)
        );

        let mut stats = CleanupStats::default();
        let entries = match catch_not_found(|| read_dir(self.cache_dir()))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", self.cache_dir().display());
                return Ok(stats);
            }
        };

        let now = SystemTime::now();
        for entry in entries {
            let path = entry?.path();
            if let Err(e) = try_cleanup_path(&path, now, max_age, &mut stats) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to clean cache file",
                );
            }
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }
}

/// Tries to clean up the file at `path`, returning `true` if it was removed.
fn try_cleanup_path(
    path: &Path,
    now: SystemTime,
    max_age: Duration,
    stats: &mut CleanupStats,
) -> io::Result<bool> {
    tracing::trace!("Checking file `{}`", path.display());
    let Some(metadata) = catch_not_found(|| path.metadata())? else {
        return Ok(true);
    };
    if !metadata.is_file() {
        return Ok(false);
    }
    let size = metadata.len();

    let age = now
        .duration_since(metadata.modified()?)
        .unwrap_or_default();
    let expired = max_age.is_zero() || age.as_secs() > max_age.as_secs();

    if expired {
        tracing::debug!("Removing file `{}`", path.display());
        catch_not_found(|| remove_file(path))?;

        stats.removed_bytes += size;
        stats.removed_files += 1;

        return Ok(true);
    }
    stats.retained_bytes += size;
    stats.retained_files += 1;

    Ok(false)
}
