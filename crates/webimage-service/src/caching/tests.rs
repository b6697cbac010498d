use std::fs;
use std::time::{Duration, SystemTime};

use filetime::FileTime;

use crate::test;

use super::*;

fn disk_cache(root: &test::TempDir) -> DiskCache {
    DiskCache::new(root.path().join("images"), root.path().join("tmp")).unwrap()
}

fn set_age(cache: &DiskCache, key: &CacheKey, age: Duration) {
    let mtime = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(cache.path(key), mtime).unwrap();
}

#[test]
fn test_disk_round_trip() {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = disk_cache(&cache_dir);
    let key = CacheKey::from_source("https://example.com/cat.png");

    assert!(!cache.exists(&key));
    assert_eq!(cache.read(&key), Err(LoadError::NotFound));
    assert_eq!(cache.age(&key).unwrap(), None);

    cache.write(&key, b"meow").unwrap();
    assert!(cache.exists(&key));
    assert_eq!(&cache.read(&key).unwrap()[..], b"meow");
    assert_eq!(
        cache.path(&key),
        cache_dir.path().join("images").join(key.file_name())
    );

    // overwriting replaces the contents atomically
    cache.write(&key, b"purr").unwrap();
    assert_eq!(&cache.read(&key).unwrap()[..], b"purr");

    assert!(cache.delete(&key).unwrap());
    assert!(!cache.exists(&key));
    assert!(!cache.delete(&key).unwrap());
}

#[test]
fn test_disk_age_and_touch() {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = disk_cache(&cache_dir);
    let key = CacheKey::from_source("https://example.com/cat.png");

    cache.write(&key, b"meow").unwrap();
    set_age(&cache, &key, Duration::from_secs(3600));

    let age = cache.age(&key).unwrap().unwrap();
    assert!(age >= Duration::from_secs(3600));

    cache.touch(&key).unwrap();
    let age = cache.age(&key).unwrap().unwrap();
    assert!(age < Duration::from_secs(60));
}

#[test]
fn test_tempfiles_are_cleared() {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = disk_cache(&cache_dir);

    let temp_file = cache.tempfile().unwrap();
    let leftover = temp_file.into_temp_path().keep().unwrap();
    assert!(leftover.exists());

    cache.clear_tmp().unwrap();
    assert!(!leftover.exists());
    assert!(cache_dir.path().join("tmp").is_dir());
}

#[test]
fn test_evict_older_than() {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = disk_cache(&cache_dir);
    let max_age = Duration::from_secs(3600);

    let keys: Vec<_> = [0, 3599, 3600, 3601]
        .into_iter()
        .map(|secs| {
            let key = CacheKey::from_source(&format!("https://example.com/{secs}.png"));
            cache.write(&key, b"meow").unwrap();
            set_age(&cache, &key, Duration::from_secs(secs));
            key
        })
        .collect();

    let stats = cache.evict_older_than(max_age).unwrap();
    assert_eq!(stats.removed_files, 1);
    assert_eq!(stats.removed_bytes, 4);
    assert_eq!(stats.retained_files, 3);

    let remaining: Vec<_> = keys.iter().map(|key| cache.exists(key)).collect();
    assert_eq!(remaining, [true, true, true, false]);
}

#[test]
fn test_evict_whole_seconds() {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = disk_cache(&cache_dir);

    let keys: Vec<_> = [10_500, 11_500]
        .into_iter()
        .map(|millis| {
            let key = CacheKey::from_source(&format!("https://example.com/{millis}.png"));
            cache.write(&key, b"meow").unwrap();
            set_age(&cache, &key, Duration::from_millis(millis));
            key
        })
        .collect();

    // 10.5 seconds counts as 10, and the 900 ms of `max_age` are dropped
    let stats = cache
        .evict_older_than(Duration::from_millis(10_900))
        .unwrap();
    assert_eq!(stats.removed_files, 1);

    let remaining: Vec<_> = keys.iter().map(|key| cache.exists(key)).collect();
    assert_eq!(remaining, [true, false]);
}

#[test]
fn test_evict_all() {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = disk_cache(&cache_dir);

    for name in ["cat", "dog"] {
        let key = CacheKey::from_source(&format!("https://example.com/{name}.png"));
        cache.write(&key, b"woof").unwrap();
    }
    // directories are never touched
    fs::create_dir(cache.cache_dir().join("unrelated")).unwrap();

    let stats = cache.evict_older_than(Duration::ZERO).unwrap();
    assert_eq!(stats.removed_files, 2);
    assert_eq!(stats.retained_files, 0);
    assert!(cache.cache_dir().join("unrelated").is_dir());
}

#[test]
fn test_evict_missing_directory() {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = disk_cache(&cache_dir);
    fs::remove_dir_all(cache.cache_dir()).unwrap();

    let stats = cache.evict_older_than(Duration::ZERO).unwrap();
    assert_eq!(stats, CleanupStats::default());
}
