use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

use crate::core::types::NutrientRecord;
use crate::utils::Metrics;

/// In-memory LRU of extraction results keyed by recognized text
///
/// Identical text maps to an identical record without a second call to the
/// text-understanding service.
#[derive(Clone)]
pub struct ExtractionCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    cache: RwLock<LruCache<String, NutrientRecord>>,
    metrics: Option<Metrics>,
}

impl ExtractionCache {
    pub fn new(max_entries: usize, metrics: Option<Metrics>) -> Self {
        let max = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(CacheInner {
                cache: RwLock::new(LruCache::new(max)),
                metrics,
            }),
        }
    }

    /// xxh3 of the text, as hex
    pub fn key_for(text: &str) -> String {
        format!("{:016x}", xxh3_64(text.as_bytes()))
    }

    /// Look up a record; records a hit or a miss
    pub fn get(&self, key: &str) -> Option<NutrientRecord> {
        // LruCache::get promotes the entry, so it needs the write lock
        let found = self.inner.cache.write().get(key).cloned();

        if let Some(ref m) = self.inner.metrics {
            if found.is_some() {
                m.record_cache_hit();
            } else {
                m.record_cache_miss();
            }
        }
        found
    }

    pub fn put(&self, key: String, record: &NutrientRecord) {
        let mut cache = self.inner.cache.write();
        cache.put(key, record.clone());

        if let Some(ref m) = self.inner.metrics {
            m.update_cache_size(cache.len());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.cache.write().clear();
        if let Some(ref m) = self.inner.metrics {
            m.update_cache_size(0);
        }
    }
}
