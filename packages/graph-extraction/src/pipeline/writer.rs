//! Batched, idempotent graph writer.
//!
//! Facts are grouped into commits of `batch_size` rows. Every commit is a
//! single [`GraphStore::merge_batch`] call, so replaying the same facts never
//! creates duplicates. Write conflicts are retried with doubling backoff;
//! if they persist, the batch is split by `shrink_factor` and each piece is
//! tried once more before the write fails.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{WriteError, WriteResult};
use crate::traits::graph::{GraphBatch, GraphStore};
use crate::types::config::WriterConfig;
use crate::types::fact::Fact;
use crate::types::write::{BatchWriteResult, MergeStats};

/// Buffers facts and commits them in batches.
pub struct BatchGraphWriter<G> {
    graph: G,
    config: WriterConfig,
    buffer: Mutex<Vec<Fact>>,
    totals: Mutex<BatchWriteResult>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<G: GraphStore> BatchGraphWriter<G> {
    pub fn new(graph: G, config: WriterConfig) -> Self {
        Self {
            graph,
            config,
            buffer: Mutex::new(Vec::new()),
            totals: Mutex::new(BatchWriteResult::default()),
        }
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Facts waiting for the next flush.
    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Everything written since the writer was created.
    pub fn totals(&self) -> BatchWriteResult {
        lock(&self.totals).clone()
    }

    /// Buffer facts, committing every full batch.
    ///
    /// Returns the result of the commits this call triggered, if any. On
    /// error the failed batch and every batch behind it go back to the front
    /// of the buffer, so the next flush retries them. Rows of the failed
    /// batch that did commit are merged again, which is harmless.
    pub async fn enqueue(&self, facts: Vec<Fact>) -> WriteResult<Option<BatchWriteResult>> {
        let batch_size = self.config.batch_size.max(1);
        let ready: Vec<Vec<Fact>> = {
            let mut buffer = lock(&self.buffer);
            buffer.extend(facts);
            let mut ready = Vec::new();
            while buffer.len() >= batch_size {
                ready.push(buffer.drain(..batch_size).collect());
            }
            ready
        };

        if ready.is_empty() {
            return Ok(None);
        }
        let mut total = BatchWriteResult::default();
        let mut ready = ready.into_iter();
        while let Some(batch) = ready.next() {
            match self.write_batch(&batch).await {
                Ok(result) => total.absorb(result),
                Err(e) => {
                    let unwritten: Vec<Fact> = std::iter::once(batch).chain(ready).flatten().collect();
                    self.restore(unwritten, &e);
                    return Err(e);
                }
            }
        }
        Ok(Some(total))
    }

    /// Buffer a document's facts unless the document was cancelled.
    pub async fn enqueue_document(
        &self,
        doc_id: Uuid,
        facts: Vec<Fact>,
        cancel: &CancellationToken,
    ) -> WriteResult<Option<BatchWriteResult>> {
        if cancel.is_cancelled() {
            return Err(WriteError::Cancelled(doc_id));
        }
        self.enqueue(facts).await
    }

    /// Commit whatever is buffered. On error the facts stay buffered.
    pub async fn flush(&self) -> WriteResult<BatchWriteResult> {
        let pending: Vec<Fact> = std::mem::take(&mut *lock(&self.buffer));
        if pending.is_empty() {
            return Ok(BatchWriteResult::default());
        }
        match self.write_batch(&pending).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.restore(pending, &e);
                Err(e)
            }
        }
    }

    /// Put uncommitted facts back ahead of anything buffered since.
    fn restore(&self, facts: Vec<Fact>, error: &WriteError) {
        warn!(rows = facts.len(), error = %error, "graph commit failed; facts kept for the next flush");
        let mut buffer = lock(&self.buffer);
        buffer.splice(0..0, facts);
    }

    /// Commit `facts` directly, in chunks of `batch_size`.
    pub async fn write_batch(&self, facts: &[Fact]) -> WriteResult<BatchWriteResult> {
        let started = Instant::now();
        let mut result = BatchWriteResult::default();

        for chunk in facts.chunks(self.config.batch_size.max(1)) {
            let chunk_result = self.commit_chunk(chunk, result.rows_written).await?;
            result.absorb(chunk_result);
        }
        result.duration = started.elapsed();

        info!(
            rows = result.rows_written,
            edges = result.edges_written,
            commits = result.commits,
            created = result.created(),
            conflict_retries = result.conflict_retries,
            shrunk = result.shrunk,
            rows_per_sec = result.rows_per_second() as u64,
            "graph batch written"
        );
        if result.rows_written >= self.config.batch_size && !result.meets_target(self.config.target_rows_per_sec) {
            warn!(
                rows_per_sec = result.rows_per_second() as u64,
                target = self.config.target_rows_per_sec as u64,
                "graph write throughput below target"
            );
        }

        lock(&self.totals).absorb(result.clone());
        Ok(result)
    }

    async fn commit_chunk(&self, chunk: &[Fact], committed_before: usize) -> WriteResult<BatchWriteResult> {
        let mut retries = 0u32;
        loop {
            match self.commit_once(chunk).await {
                Ok(merge) => {
                    let mut result = chunk_result(chunk, merge);
                    result.conflict_retries = retries;
                    return Ok(result);
                }
                Err(WriteError::Graph(e)) if e.is_transient() => {
                    if retries >= self.config.max_conflict_retries {
                        warn!(rows = chunk.len(), retries, error = %e, "conflicts persisted; shrinking batch");
                        break;
                    }
                    let delay = self.config.conflict_delay(retries);
                    debug!(rows = chunk.len(), attempt = retries + 1, delay_ms = delay.as_millis() as u64, "write conflict; retrying");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let piece_len = chunk.len().div_ceil(self.config.shrink_factor.max(2)).max(1);
        let mut result = BatchWriteResult {
            conflict_retries: retries,
            shrunk: true,
            ..BatchWriteResult::default()
        };
        for piece in chunk.chunks(piece_len) {
            match self.commit_once(piece).await {
                Ok(merge) => result.absorb(chunk_result(piece, merge)),
                Err(WriteError::Graph(e)) if e.is_transient() => {
                    return Err(WriteError::ConflictsPersisted {
                        attempts: retries + 2,
                        rows_committed: committed_before + result.rows_written,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    async fn commit_once(&self, facts: &[Fact]) -> WriteResult<MergeStats> {
        let batch = GraphBatch::from_facts(facts, Utc::now());
        match tokio::time::timeout(self.config.commit_timeout, self.graph.merge_batch(&batch)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WriteError::Timeout(self.config.commit_timeout)),
        }
    }
}

fn chunk_result(facts: &[Fact], merge: MergeStats) -> BatchWriteResult {
    BatchWriteResult {
        commits: 1,
        rows_written: facts.len(),
        edges_written: facts.iter().filter(|f| f.is_relationship()).count(),
        merge,
        ..BatchWriteResult::default()
    }
}
