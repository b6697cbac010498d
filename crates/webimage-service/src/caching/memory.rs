use std::sync::Arc;

use crate::config::CacheConfig;

use super::CacheKey;

type InMemoryCache<T> = moka::sync::Cache<CacheKey, Arc<T>>;

/// The in-memory tier holding decoded payloads.
///
/// Entries are evicted by weight and idle time at any moment, so a hit is an optimization only
/// and never a sign that the resource exists anywhere else.
pub struct MemoryCache<T> {
    cache: InMemoryCache<T>,
}

impl<T> std::fmt::Debug for MemoryCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("in-memory items", &self.cache.entry_count())
            .finish()
    }
}

impl<T: Send + Sync + 'static> MemoryCache<T> {
    pub fn new(config: &CacheConfig, weight: fn(&T) -> u32) -> Self {
        let mut builder = InMemoryCache::builder()
            .max_capacity(config.in_memory_capacity)
            .name("images")
            // NOTE: we count all the bookkeeping structures to the weight as well
            .weigher(move |_k, v: &Arc<T>| {
                let key_size = std::mem::size_of::<CacheKey>() as u32;
                key_size.saturating_add(weight(v))
            });
        if let Some(time_to_idle) = config.in_memory_time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }

        Self {
            cache: builder.build(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<T>> {
        let item = self.cache.get(key);
        tracing::trace!(
            "Memory tier {} for `{}`",
            if item.is_some() { "hit" } else { "miss" },
            key.source()
        );
        item
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn insert(&self, key: CacheKey, item: Arc<T>) {
        self.cache.insert(key, item);
    }

    pub fn remove(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
