//! Dead letter queue for Tier C windows.
//!
//! Entries live in the shared [`KvStore`] so any worker can pick them up:
//!
//! - `dlq:extraction:{hash}`: the entry while it is pending or retrying
//! - `dlq:retry:{hash}`: retry counter (atomic increment)
//! - `dlq:failed:{hash}`: permanently failed entries, kept longer
//! - `dlq:pending`: sorted set of hashes scored by next-retry time (ms)
//!
//! Removing a hash from `dlq:pending` is the claim: only the worker whose
//! `zrem` succeeds runs the retry, so no two workers retry the same entry.
//! A claim that is never settled (the worker failed or died) is handed back
//! with [`DeadLetterQueue::release`] or, after `claim_timeout`, by
//! [`DeadLetterQueue::reclaim_stale`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::pipeline::cache::encode;
use crate::traits::kv::KvStore;
use crate::types::config::DlqConfig;
use crate::types::dlq::{DlqEntry, DlqState, FailureKind};

const ENTRY_PREFIX: &str = "dlq:extraction:";
const RETRY_PREFIX: &str = "dlq:retry:";
const FAILED_PREFIX: &str = "dlq:failed:";
const PENDING_SET: &str = "dlq:pending";

/// Dead letter queue over a shared key/TTL store.
pub struct DeadLetterQueue<K> {
    store: K,
    config: DlqConfig,
}

impl<K: KvStore> DeadLetterQueue<K> {
    pub fn new(store: K, config: DlqConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn is_permanent(&self, failure: FailureKind) -> bool {
        match failure {
            FailureKind::NonRetryable => true,
            FailureKind::SchemaInvalid => !self.config.retry_schema_invalid,
            FailureKind::Transient => false,
        }
    }

    /// Record a first failure.
    ///
    /// Content that is already queued or failed is tracked once: the new
    /// window joins the stored entry, so recovering it later yields facts for
    /// this document too.
    pub async fn record_failure(&self, mut entry: DlqEntry, now: DateTime<Utc>) -> StoreResult<DlqEntry> {
        if let Some(mut existing) = self.get(&entry.content_hash).await? {
            if existing.add_waiting(entry.window) {
                self.save(&existing).await?;
                debug!(content_hash = %existing.content_hash, waiting = existing.waiting.len(), "window joined queued entry");
            }
            return Ok(existing);
        }
        if let Some(mut existing) = self.failed(&entry.content_hash).await? {
            if existing.add_waiting(entry.window) {
                self.save_failed(&existing).await?;
            }
            return Ok(existing);
        }

        if self.is_permanent(entry.failure) {
            return self.fail_permanently(entry, now).await;
        }

        entry.state = DlqState::Pending;
        self.schedule(&mut entry, now).await?;
        info!(
            doc_id = %entry.doc_id(),
            window_id = %entry.window_id(),
            failure = entry.failure.as_str(),
            next_retry_at = ?entry.next_retry_at,
            "window dead-lettered"
        );
        Ok(entry)
    }

    /// Claim up to `limit` entries whose retry time has come.
    ///
    /// Each claimed entry has its retry counter incremented and is moved to
    /// `Retrying`. Entries another worker claimed first are skipped.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DlqEntry>> {
        let due = self
            .store
            .zrange_by_score(PENDING_SET, f64::NEG_INFINITY, now.timestamp_millis() as f64, limit)
            .await?;

        let mut claimed = Vec::with_capacity(due.len());
        for (hash, _) in due {
            if !self.store.zrem(PENDING_SET, &hash).await? {
                continue;
            }
            let Some(mut entry) = self.get(&hash).await? else {
                warn!(content_hash = %hash, "pending hash without entry; dropping");
                continue;
            };

            let retry_key = format!("{}{}", RETRY_PREFIX, hash);
            let count = self.store.incr(&retry_key).await?;
            self.store.expire(&retry_key, self.config.entry_ttl).await?;
            entry.retry_count = u32::try_from(count).unwrap_or(u32::MAX);

            if entry.retry_count > self.config.max_retries {
                self.fail_permanently(entry, now).await?;
                continue;
            }

            entry.state = DlqState::Retrying {
                attempt: entry.retry_count,
            };
            entry.next_retry_at = None;
            entry.claimed_at = Some(now);
            self.save(&entry).await?;
            claimed.push(entry);
        }
        Ok(claimed)
    }

    /// A retry succeeded for every window of `entry`: forget it.
    ///
    /// Windows that joined the stored entry after it was claimed got no facts
    /// from this retry; they stay queued as a new entry, due immediately.
    pub async fn mark_succeeded(&self, entry: &DlqEntry, now: DateTime<Utc>) -> StoreResult<()> {
        let hash = &entry.content_hash;
        let late: Vec<_> = match self.get(hash).await? {
            Some(stored) => stored
                .waiting
                .into_iter()
                .filter(|w| !entry.windows().any(|done| done.window_id == w.window_id))
                .collect(),
            None => Vec::new(),
        };

        self.store.del(&format!("{}{}", RETRY_PREFIX, hash)).await?;
        info!(
            doc_id = %entry.doc_id(),
            window_id = %entry.window_id(),
            retries = entry.retry_count,
            windows = entry.waiting.len() + 1,
            "dead-lettered window recovered"
        );

        let mut late = late.into_iter();
        let Some(first) = late.next() else {
            self.store.del(&format!("{}{}", ENTRY_PREFIX, hash)).await?;
            self.store.zrem(PENDING_SET, hash).await?;
            return Ok(());
        };
        let mut next = DlqEntry::new(first, entry.extractor_version.clone(), hash.clone(), entry.failure, entry.error.clone());
        next.waiting = late.collect();
        next.state = DlqState::Pending;
        next.next_retry_at = Some(now);
        self.save(&next).await?;
        self.store
            .zadd(PENDING_SET, hash, now.timestamp_millis() as f64)
            .await
    }

    /// A retry failed: reschedule, or fail permanently once out of retries.
    pub async fn mark_retry_failed(
        &self,
        mut entry: DlqEntry,
        failure: FailureKind,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<DlqEntry> {
        entry.record_failure(failure, error);
        entry.claimed_at = None;
        if let Some(stored) = self.get(&entry.content_hash).await? {
            for window in stored.waiting {
                entry.add_waiting(window);
            }
        }
        if self.is_permanent(failure) || entry.retry_count >= self.config.max_retries {
            return self.fail_permanently(entry, now).await;
        }
        entry.state = DlqState::Pending;
        self.schedule(&mut entry, now).await?;
        Ok(entry)
    }

    /// Move an entry to the failed keyspace.
    pub async fn fail_permanently(&self, mut entry: DlqEntry, now: DateTime<Utc>) -> StoreResult<DlqEntry> {
        let hash = entry.content_hash.clone();
        entry.state = DlqState::PermanentlyFailed;
        entry.next_retry_at = None;
        entry.claimed_at = None;
        entry.last_failed_at = entry.last_failed_at.max(now);

        self.save_failed(&entry).await?;
        self.store.del(&format!("{}{}", ENTRY_PREFIX, hash)).await?;
        self.store.del(&format!("{}{}", RETRY_PREFIX, hash)).await?;
        self.store.zrem(PENDING_SET, &hash).await?;

        warn!(
            doc_id = %entry.doc_id(),
            window_id = %entry.window_id(),
            retries = entry.retry_count,
            failure = entry.failure.as_str(),
            error = %entry.error,
            "window permanently failed"
        );
        Ok(entry)
    }

    /// Give back a claimed entry whose retry never reached a verdict, for
    /// instance because inference or a store was unreachable.
    ///
    /// The attempt is not counted: the retry counter is rolled back and the
    /// entry is due again after its previous backoff. Entries that are no
    /// longer `Retrying` were settled by someone and are left alone.
    pub async fn release(&self, content_hash: &str, now: DateTime<Utc>) -> StoreResult<Option<DlqEntry>> {
        let Some(mut entry) = self.get(content_hash).await? else {
            return Ok(None);
        };
        if !matches!(entry.state, DlqState::Retrying { .. }) {
            return Ok(None);
        }

        entry.retry_count = entry.retry_count.saturating_sub(1);
        let retry_key = format!("{}{}", RETRY_PREFIX, content_hash);
        self.store
            .set_ex(&retry_key, &entry.retry_count.to_string(), self.config.entry_ttl)
            .await?;
        entry.state = DlqState::Pending;
        entry.claimed_at = None;
        self.schedule(&mut entry, now).await?;
        info!(
            doc_id = %entry.doc_id(),
            window_id = %entry.window_id(),
            retry_count = entry.retry_count,
            next_retry_at = ?entry.next_retry_at,
            "claimed window released"
        );
        Ok(Some(entry))
    }

    /// Release up to `limit` entries that have sat in `Retrying` for longer
    /// than `claim_timeout`.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<usize> {
        let timeout = ChronoDuration::from_std(self.config.claim_timeout).unwrap_or_else(|_| ChronoDuration::days(365));
        let threshold = now - timeout;

        let mut released = 0;
        for key in self.store.scan_prefix(ENTRY_PREFIX, usize::MAX).await? {
            if released >= limit {
                break;
            }
            let Some(entry) = self.load(&key).await? else {
                continue;
            };
            let stale = matches!(entry.state, DlqState::Retrying { .. })
                && entry.claimed_at.is_none_or(|at| at <= threshold);
            if stale && self.release(&entry.content_hash, now).await?.is_some() {
                warn!(content_hash = %entry.content_hash, claimed_at = ?entry.claimed_at, "stale claim released");
                released += 1;
            }
        }
        Ok(released)
    }

    /// Put a permanently failed entry back on the schedule with a fresh
    /// retry budget, due immediately.
    pub async fn requeue_failed(&self, content_hash: &str, now: DateTime<Utc>) -> StoreResult<Option<DlqEntry>> {
        let Some(mut entry) = self.failed(content_hash).await? else {
            return Ok(None);
        };
        entry.state = DlqState::Pending;
        entry.retry_count = 0;
        entry.next_retry_at = Some(now);
        self.save(&entry).await?;
        self.store
            .zadd(PENDING_SET, content_hash, now.timestamp_millis() as f64)
            .await?;
        self.store.del(&format!("{}{}", FAILED_PREFIX, content_hash)).await?;
        self.store.del(&format!("{}{}", RETRY_PREFIX, content_hash)).await?;
        info!(content_hash = %content_hash, "failed window requeued");
        Ok(Some(entry))
    }

    /// Entry that is pending or retrying.
    pub async fn get(&self, content_hash: &str) -> StoreResult<Option<DlqEntry>> {
        self.load(&format!("{}{}", ENTRY_PREFIX, content_hash)).await
    }

    /// Permanently failed entry.
    pub async fn failed(&self, content_hash: &str) -> StoreResult<Option<DlqEntry>> {
        self.load(&format!("{}{}", FAILED_PREFIX, content_hash)).await
    }

    /// Pending entries, earliest due first.
    pub async fn list_pending(&self, limit: usize) -> StoreResult<Vec<DlqEntry>> {
        let members = self
            .store
            .zrange_by_score(PENDING_SET, f64::NEG_INFINITY, f64::INFINITY, limit)
            .await?;
        let mut entries = Vec::with_capacity(members.len());
        for (hash, _) in members {
            if let Some(entry) = self.get(&hash).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn list_failed(&self, limit: usize) -> StoreResult<Vec<DlqEntry>> {
        let keys = self.store.scan_prefix(FAILED_PREFIX, limit).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.load(&key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn pending_count(&self) -> StoreResult<usize> {
        self.store.zcard(PENDING_SET).await
    }

    pub async fn failed_count(&self) -> StoreResult<usize> {
        Ok(self.store.scan_prefix(FAILED_PREFIX, usize::MAX).await?.len())
    }

    async fn schedule(&self, entry: &mut DlqEntry, now: DateTime<Utc>) -> StoreResult<()> {
        let delay = self.config.backoff(entry.retry_count);
        let next = now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::days(365));
        entry.next_retry_at = Some(next);
        self.save(entry).await?;
        self.store
            .zadd(PENDING_SET, &entry.content_hash, next.timestamp_millis() as f64)
            .await
    }

    async fn save(&self, entry: &DlqEntry) -> StoreResult<()> {
        let key = format!("{}{}", ENTRY_PREFIX, entry.content_hash);
        let value = encode(&key, entry)?;
        self.store.set_ex(&key, &value, self.config.entry_ttl).await
    }

    async fn save_failed(&self, entry: &DlqEntry) -> StoreResult<()> {
        let key = format!("{}{}", FAILED_PREFIX, entry.content_hash);
        let value = encode(&key, entry)?;
        self.store.set_ex(&key, &value, self.config.failed_ttl).await
    }

    async fn load(&self, key: &str) -> StoreResult<Option<DlqEntry>> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}
