use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// The key of a cached resource.
///
/// This is the SHA-256 digest of the resource's source URL. Its lowercase hex representation is
/// used both as the key of the in-memory cache and as the file name in the disk cache.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    source: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the given source URL.
    pub fn from_url(url: &Url) -> Self {
        Self::from_source(url.as_str())
    }

    /// Creates the [`CacheKey`] for a raw source identifier.
    ///
    /// **NOTE**: The bytes of `source` are hashed as-is. Two differently spelled URLs pointing to
    /// the same resource get different keys, so callers should hash the normalized URL.
    pub fn from_source(source: &str) -> Self {
        let hash = Sha256::digest(source.as_bytes());
        // FIXME: `sha2` should really adopt const generics, this is such a pain right now
        let hash = <[u8; 32]>::try_from(hash).expect("sha256 outputs 32 bytes");

        CacheKey {
            source: source.into(),
            hash,
        }
    }

    /// Returns the source identifier this key was created from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the file name of this key in the disk cache.
    ///
    /// The file name is the hex-formatted sha-256 hash, which is always 64 characters long.
    pub fn file_name(&self) -> String {
        let mut name = String::with_capacity(64);
        for b in &self.hash {
            name.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashed_file_name() {
        let key = CacheKey::from_source("abc");

        assert_eq!(
            key.file_name(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(key.to_string(), key.file_name());
        assert_eq!(key.source(), "abc");
    }

    #[test]
    fn test_stable_and_distinct() {
        let url: Url = "https://example.com/images/cat.png".parse().unwrap();

        let key = CacheKey::from_url(&url);
        assert_eq!(key, CacheKey::from_source("https://example.com/images/cat.png"));
        assert_eq!(key.file_name().len(), 64);
        assert!(key.file_name().chars().all(|c| c.is_ascii_hexdigit()));

        let other: Url = "https://example.com/images/dog.png".parse().unwrap();
        assert_ne!(key, CacheKey::from_url(&other));
    }
}
