//! Content-addressed cache of validated Tier C results.
//!
//! Keyed by a hash of the window text plus the extractor version, so a
//! version bump misses every old entry without a purge. Values live in the
//! shared [`KvStore`] with a TTL; nothing is held in process memory apart
//! from hit/miss counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::pipeline::schema::NormalizedExtraction;
use crate::traits::kv::KvStore;

const RESULT_PREFIX: &str = "extraction:";
const META_PREFIX: &str = "extraction:meta:";

/// Cache key for a window: SHA-256 of text, a unit separator, and version.
pub fn cache_key(text: &str, extractor_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0x1f]);
    hasher.update(extractor_version.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stored alongside each cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub extractor_version: String,
    pub cached_at: DateTime<Utc>,
}

/// Hit/miss counters since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Extraction cache over a shared key/TTL store.
pub struct ExtractionCache<K> {
    store: K,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: KvStore> ExtractionCache<K> {
    pub fn new(store: K, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    /// Look up a cached result.
    ///
    /// A value that no longer decodes is deleted and reported as a miss.
    pub async fn get(&self, key: &str) -> StoreResult<Option<NormalizedExtraction>> {
        let result_key = format!("{}{}", RESULT_PREFIX, key);
        let Some(raw) = self.store.get(&result_key).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "extraction cache hit");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "dropping corrupt cache entry");
                self.store.del(&result_key).await?;
                self.store.del(&format!("{}{}", META_PREFIX, key)).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store a validated result and its metadata.
    pub async fn put(
        &self,
        key: &str,
        value: &NormalizedExtraction,
        extractor_version: &str,
    ) -> StoreResult<()> {
        let meta = CacheMeta {
            extractor_version: extractor_version.to_string(),
            cached_at: Utc::now(),
        };
        let value = encode(key, value)?;
        let meta = encode(key, &meta)?;
        self.store
            .set_ex(&format!("{}{}", RESULT_PREFIX, key), &value, self.ttl)
            .await?;
        self.store
            .set_ex(&format!("{}{}", META_PREFIX, key), &meta, self.ttl)
            .await
    }

    pub async fn meta(&self, key: &str) -> StoreResult<Option<CacheMeta>> {
        let meta_key = format!("{}{}", META_PREFIX, key);
        match self.store.get(&meta_key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: meta_key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn invalidate(&self, key: &str) -> StoreResult<bool> {
        let existed = self.store.del(&format!("{}{}", RESULT_PREFIX, key)).await?;
        self.store.del(&format!("{}{}", META_PREFIX, key)).await?;
        Ok(existed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
