//! Tier C: schema-constrained inference over escalated windows.
//!
//! Windows are looked up in the extraction cache first. Misses are grouped
//! into batches of `batch_size`, at most `parallelism` batches in flight, and
//! every call is bounded by `call_timeout`. Replies are parsed and validated;
//! an invalid reply is re-asked for that window alone, up to
//! `max_validation_retries` times. Whatever still fails is returned as a
//! dead letter entry, never as facts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{InferenceError, StoreResult};
use crate::pipeline::cache::{cache_key, ExtractionCache};
use crate::pipeline::schema::{output_schema, parse_reply, validate, NormalizedExtraction};
use crate::traits::inference::{InferenceClient, InferenceItem, InferenceReply, InferenceRequest};
use crate::traits::kv::KvStore;
use crate::types::config::InferenceConfig;
use crate::types::dlq::{DlqEntry, FailureKind};
use crate::types::document::Window;
use crate::types::fact::Fact;

/// Result of Tier C for one window.
#[derive(Debug, Clone)]
pub enum WindowOutcome {
    Extracted {
        window_id: Uuid,
        facts: Vec<Fact>,
        cached: bool,
    },
    DeadLettered(DlqEntry),
}

impl WindowOutcome {
    pub fn window_id(&self) -> Uuid {
        match self {
            WindowOutcome::Extracted { window_id, .. } => *window_id,
            WindowOutcome::DeadLettered(entry) => entry.window_id(),
        }
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, WindowOutcome::DeadLettered(_))
    }
}

/// Counters for Tier C activity.
#[derive(Debug, Default)]
struct CallCounters {
    calls: AtomicU64,
    reasks: AtomicU64,
    timeouts: AtomicU64,
}

/// Tier C runner: cache lookups, batched calls and reply validation.
pub struct InferenceTier<K, I> {
    cache: ExtractionCache<K>,
    client: I,
    config: InferenceConfig,
    extractor_version: String,
    schema: Value,
    counters: CallCounters,
}

/// A cache miss waiting for a model call.
struct Pending<'a> {
    key: String,
    window: &'a Window,
}

enum Attempt {
    Valid(NormalizedExtraction),
    Failed { failure: FailureKind, error: String },
}

impl<K: KvStore, I: InferenceClient> InferenceTier<K, I> {
    pub fn new(
        cache: ExtractionCache<K>,
        client: I,
        config: InferenceConfig,
        extractor_version: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            client,
            config,
            extractor_version: extractor_version.into(),
            schema: output_schema(),
            counters: CallCounters::default(),
        }
    }

    pub fn cache(&self) -> &ExtractionCache<K> {
        &self.cache
    }

    pub fn client(&self) -> &I {
        &self.client
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Model calls issued so far (batched calls and single-window re-asks).
    pub fn calls(&self) -> u64 {
        self.counters.calls.load(Ordering::Relaxed)
    }

    /// Extract from `windows`, returning one outcome per window in input order.
    ///
    /// Only store failures are errors; every per-window problem becomes a
    /// [`WindowOutcome::DeadLettered`].
    pub async fn extract(&self, windows: &[Window]) -> StoreResult<Vec<WindowOutcome>> {
        let started = Instant::now();
        let mut results: Vec<Option<Result<(NormalizedExtraction, bool), (FailureKind, String)>>> =
            vec![None; windows.len()];

        // Identical text in one call shares a single model request.
        let mut pending: Vec<Pending<'_>> = Vec::new();
        let mut followers: HashMap<String, Vec<usize>> = HashMap::new();

        for (index, window) in windows.iter().enumerate() {
            let key = cache_key(&window.text, &self.extractor_version);
            if let Some(indexes) = followers.get_mut(&key) {
                indexes.push(index);
                continue;
            }
            if let Some(hit) = self.cache.get(&key).await? {
                results[index] = Some(Ok((hit, true)));
                continue;
            }
            if window.token_count > self.config.max_window_tokens {
                results[index] = Some(Err((
                    FailureKind::NonRetryable,
                    format!(
                        "window has {} tokens, limit is {}",
                        window.token_count, self.config.max_window_tokens
                    ),
                )));
                continue;
            }
            followers.insert(key.clone(), vec![index]);
            pending.push(Pending { key, window });
        }

        let batches: Vec<&[Pending<'_>]> = pending.chunks(self.config.batch_size.max(1)).collect();
        let attempts: Vec<Vec<Attempt>> = stream::iter(batches.iter().map(|batch| self.run_batch(batch)))
            .buffered(self.config.parallelism.max(1))
            .collect()
            .boxed()
            .await;

        for (item, attempt) in pending.iter().zip(attempts.into_iter().flatten()) {
            let outcome = match attempt {
                Attempt::Valid(extraction) => {
                    self.cache
                        .put(&item.key, &extraction, &self.extractor_version)
                        .await?;
                    Ok((extraction, false))
                }
                Attempt::Failed { failure, error } => Err((failure, error)),
            };
            for index in followers.get(&item.key).into_iter().flatten() {
                results[*index] = Some(outcome.clone());
            }
        }

        let outcomes: Vec<WindowOutcome> = windows
            .iter()
            .zip(results)
            .map(|(window, result)| match result {
                Some(Ok((extraction, cached))) => WindowOutcome::Extracted {
                    window_id: window.window_id,
                    facts: extraction.to_facts(window, &self.extractor_version),
                    cached,
                },
                Some(Err((failure, error))) => WindowOutcome::DeadLettered(self.dead_letter(window, failure, error)),
                None => WindowOutcome::DeadLettered(self.dead_letter(
                    window,
                    FailureKind::Transient,
                    "no reply for window".to_string(),
                )),
            })
            .collect();

        let failed = outcomes.iter().filter(|o| o.is_dead_lettered()).count();
        info!(
            windows = windows.len(),
            model_requests = pending.len(),
            failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "tier C extraction complete"
        );
        Ok(outcomes)
    }

    fn dead_letter(&self, window: &Window, failure: FailureKind, error: String) -> DlqEntry {
        warn!(
            doc_id = %window.doc_id,
            window_id = %window.window_id,
            failure = failure.as_str(),
            error = %error,
            "tier C window failed"
        );
        DlqEntry::new(
            window.clone(),
            self.extractor_version.clone(),
            cache_key(&window.text, &self.extractor_version),
            failure,
            error,
        )
    }

    async fn run_batch(&self, batch: &[Pending<'_>]) -> Vec<Attempt> {
        let windows: Vec<&Window> = batch.iter().map(|p| p.window).collect();
        let replies = match self.call(&windows).await {
            Ok(replies) => replies,
            Err(e) => {
                let failure = e.failure_kind();
                return batch
                    .iter()
                    .map(|_| Attempt::Failed {
                        failure,
                        error: e.to_string(),
                    })
                    .collect();
            }
        };
        if replies.len() != batch.len() {
            warn!(
                expected = batch.len(),
                received = replies.len(),
                "inference returned a different number of replies than items"
            );
        }

        let mut replies = replies.into_iter();
        let mut attempts = Vec::with_capacity(batch.len());
        for window in windows {
            let attempt = match replies.next() {
                Some(reply) => self.settle(window, reply).await,
                None => Attempt::Failed {
                    failure: FailureKind::Transient,
                    error: "missing reply in batch".to_string(),
                },
            };
            attempts.push(attempt);
        }
        attempts
    }

    /// Validate one reply, re-asking for this window alone while it stays invalid.
    async fn settle(&self, window: &Window, reply: InferenceReply) -> Attempt {
        let mut reply = reply;
        let mut reasks = 0;
        loop {
            let raw = match reply {
                Ok(raw) => raw,
                Err(e) => {
                    return Attempt::Failed {
                        failure: e.failure_kind(),
                        error: e.to_string(),
                    }
                }
            };

            let error = match parse_reply(&raw).and_then(|output| {
                validate(output, window, self.config.default_confidence)
            }) {
                Ok(extraction) => return Attempt::Valid(extraction),
                Err(e) => e,
            };

            if reasks >= self.config.max_validation_retries {
                return Attempt::Failed {
                    failure: FailureKind::SchemaInvalid,
                    error: error.to_string(),
                };
            }
            reasks += 1;
            self.counters.reasks.fetch_add(1, Ordering::Relaxed);
            debug!(window_id = %window.window_id, error = %error, reask = reasks, "re-asking after invalid reply");

            reply = match self.call(&[window]).await {
                Ok(mut replies) if !replies.is_empty() => replies.swap_remove(0),
                Ok(_) => Err(InferenceError::Transport("empty reply to re-ask".to_string())),
                Err(e) => Err(e),
            };
        }
    }

    async fn call(&self, windows: &[&Window]) -> Result<Vec<InferenceReply>, InferenceError> {
        let request = InferenceRequest {
            items: windows.iter().map(|w| InferenceItem::from(*w)).collect(),
            schema: self.schema.clone(),
            temperature: self.config.temperature,
        };
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.config.call_timeout, self.client.infer_batch(&request)).await {
            Ok(result) => result,
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(InferenceError::Timeout(self.config.call_timeout))
            }
        }
    }
}
