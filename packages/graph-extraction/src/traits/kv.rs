//! Key/TTL + sorted-set store shared by every worker.
//!
//! The extraction cache and the dead letter queue keep no process-local state;
//! everything lives behind this trait so any number of workers can share one
//! store. Operations mirror what a Redis-style server offers, and each key is
//! owned by a content hash so none of them need extra locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// Shared key/value store with expiry and score-ordered sets.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a live value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value without expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Set a value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> StoreResult<bool>;

    /// Atomically increment an integer value (missing keys start at 0).
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Set expiry on an existing key. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Live keys starting with `prefix`, sorted, at most `limit`.
    async fn scan_prefix(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>>;

    /// Insert or re-score a member of a sorted set.
    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Remove a member. Returns whether it was present; only one concurrent
    /// caller can observe `true` for the same member.
    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Number of members in a sorted set.
    async fn zcard(&self, set: &str) -> StoreResult<usize>;
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).set(key, value).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        (**self).set_ex(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        (**self).del(key).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        (**self).incr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        (**self).expire(key, ttl).await
    }

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        (**self).scan_prefix(prefix, limit).await
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()> {
        (**self).zadd(set, member, score).await
    }

    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool> {
        (**self).zrem(set, member).await
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        (**self).zrange_by_score(set, min, max, limit).await
    }

    async fn zcard(&self, set: &str) -> StoreResult<usize> {
        (**self).zcard(set).await
    }
}
