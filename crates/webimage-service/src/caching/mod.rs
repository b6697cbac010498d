//! The memory and disk tiers.
//!
//! # Keys
//!
//! Every resource is identified by the [`CacheKey`] of its source URL. The same key is used for
//! the memory tier and as the file name in the disk tier.
//!
//! # Disk layout
//!
//! The disk tier is a single flat directory below the configured `cache_dir`:
//!
//! ```text
//! <cache_dir>/images/<sha256 hex of the source URL>
//! <cache_dir>/tmp/<temporary files of running downloads>
//! ```
//!
//! The `mtime` of an entry is reset whenever the origin confirms that it is still fresh, so an
//! entry's age is the time since it was last known to be valid. Entries older than the configured
//! recheck age are still served, but trigger a background revalidation.

mod cache_error;
mod cache_key;
mod cleanup;
mod fs;
mod memory;

pub use cache_error::{CacheContents, LoadError};
pub use cache_key::CacheKey;
pub use cleanup::CleanupStats;
pub use fs::DiskCache;
pub use memory::MemoryCache;

#[cfg(test)]
mod tests;
