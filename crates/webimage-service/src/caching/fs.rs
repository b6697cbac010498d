use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::Config;

use super::{CacheContents, CacheKey};

/// The file system cache of downloaded resources.
///
/// All entries live in one flat directory and are named by the hex digest of their
/// [`CacheKey`]. The file `mtime` is the only metadata, and is used to keep track of both
/// "fetched at" and "last revalidated at", since literally every other filesystem attribute is
/// unreliable.
#[derive(Debug, Clone)]
pub struct DiskCache {
    /// Directory containing the cache entries. Will be created if it does not exist.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// When writing a new file into the cache it is written to a temporary file in this sibling
    /// directory first. Once fully written it is atomically moved to its location within the
    /// [`cache_dir`](Self::cache_dir).
    tmp_dir: PathBuf,
}

impl DiskCache {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::new(config.cache_dir("images"), config.cache_dir("tmp"))
    }

    pub fn new(cache_dir: PathBuf, tmp_dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;

        Ok(DiskCache { cache_dir, tmp_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path of the entry for `key`, regardless of whether it exists.
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Whether an entry for `key` exists.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.path(key).is_file()
    }

    /// Reads the entry for `key`.
    ///
    /// Returns [`LoadError::NotFound`](super::LoadError::NotFound) if there is no such entry.
    pub fn read(&self, key: &CacheKey) -> CacheContents<Bytes> {
        let path = self.path(key);
        tracing::trace!("Reading cache file at path {}", path.display());

        let data = std::fs::read(&path)?;
        Ok(Bytes::from(data))
    }

    /// Returns the time since the entry for `key` was written or last touched.
    ///
    /// Returns `None` if there is no such entry. Entries with an `mtime` in the future have an age
    /// of zero.
    pub fn age(&self, key: &CacheKey) -> io::Result<Option<Duration>> {
        catch_not_found(|| {
            let mtime = self.path(key).metadata()?.modified()?;
            Ok(mtime.elapsed().unwrap_or_default())
        })
    }

    /// Resets the age of the entry for `key`, extending its recheck window.
    pub fn touch(&self, key: &CacheKey) -> io::Result<()> {
        filetime::set_file_mtime(self.path(key), FileTime::now())
    }

    /// Removes the entry for `key`, returning whether it existed.
    pub fn delete(&self, key: &CacheKey) -> io::Result<bool> {
        let removed = catch_not_found(|| std::fs::remove_file(self.path(key)))?;
        Ok(removed.is_some())
    }

    /// Atomically writes `contents` as the entry for `key`.
    ///
    /// A partially written entry is never visible under its final name.
    pub fn write(&self, key: &CacheKey, contents: &[u8]) -> io::Result<()> {
        let mut temp_file = self.tempfile()?;
        io::Write::write_all(&mut temp_file, contents)?;
        self.persist(temp_file, key)
    }

    /// Moves a fully written temporary file into place as the entry for `key`.
    pub fn persist(&self, temp_file: NamedTempFile, key: &CacheKey) -> io::Result<()> {
        let cache_path = self.path(key);
        tracing::trace!("Creating cache file at path {}", cache_path.display());

        persist_tempfile(temp_file, &cache_path).map_err(|e| {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %cache_path.display(),
                "Failed to persist temp file",
            );
            e
        })
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        // The `cleanup` process could potentially remove the parent directories we are
        // operating in, so be defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "Failed to create temp directory",
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "Failed to create temp file",
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which survive a
    /// hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<()> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // An eviction could potentially remove the directory we are operating in, so be defensive
    // here and retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!("Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!("Failed to create cache file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
