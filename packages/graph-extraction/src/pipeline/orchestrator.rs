//! The extraction pipeline - main entry point of the library.
//!
//! Routes every window through the cheapest tier that can explain it:
//!
//! 1. Tier A (deterministic) on the whole window. If nothing is left
//!    unresolved, the window is done.
//! 2. Tier B (syntactic) on the spans Tier A did not consume.
//! 3. Tier C (inference) on the sentences Tier B escalated, batched across the
//!    document, through the cache.
//!
//! A failing window never aborts its document: it is dead-lettered and the
//! document completes with a smaller fact set and a failure count. Store
//! failures do abort, with the document and window attached to the error.
//!
//! The pipeline depends only on its ports ([`KvStore`], [`InferenceClient`],
//! [`SyntacticExtractor`], [`GraphStore`]) and holds no state of its own
//! beyond counters, the writer buffer and the snapshots of buffered
//! documents.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ExtractionError, Result, WriteError};
use crate::pipeline::cache::{CacheStats, ExtractionCache};
use crate::pipeline::deterministic::DeterministicExtractor;
use crate::pipeline::differ::{diff, FactDiff, FactSnapshot, FactSnapshotStore};
use crate::pipeline::dlq::DeadLetterQueue;
use crate::pipeline::inference::{InferenceTier, WindowOutcome};
use crate::pipeline::syntactic::SyntacticTier;
use crate::pipeline::writer::BatchGraphWriter;
use crate::traits::graph::GraphStore;
use crate::traits::inference::InferenceClient;
use crate::traits::kv::KvStore;
use crate::traits::syntactic::SyntacticExtractor;
use crate::types::config::PipelineConfig;
use crate::types::dlq::{DlqEntry, DlqState};
use crate::types::document::{Document, Window};
use crate::types::fact::{Fact, FactSet, Tier};
use crate::types::write::BatchWriteResult;

// =========================================================================
// Metrics
// =========================================================================

#[derive(Debug, Default)]
struct TierCounter {
    windows: AtomicU64,
    resolved: AtomicU64,
    facts: AtomicU64,
    latency_us: AtomicU64,
}

impl TierCounter {
    fn record(&self, resolved: bool, facts: usize, elapsed: Duration) {
        self.windows.fetch_add(1, Ordering::Relaxed);
        if resolved {
            self.resolved.fetch_add(1, Ordering::Relaxed);
        }
        self.facts.fetch_add(facts as u64, Ordering::Relaxed);
        self.latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, tier: Tier) -> TierStats {
        TierStats {
            tier,
            windows: self.windows.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            facts: self.facts.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_us.load(Ordering::Relaxed)),
        }
    }
}

/// Per-tier counters since the pipeline was created.
#[derive(Debug, Default)]
struct TierMetrics {
    a: TierCounter,
    b: TierCounter,
    c: TierCounter,
}

impl TierMetrics {
    fn tier(&self, tier: Tier) -> &TierCounter {
        match tier {
            Tier::A => &self.a,
            Tier::B => &self.b,
            Tier::C => &self.c,
        }
    }
}

/// Activity of one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub tier: Tier,

    /// Windows the tier ran on
    pub windows: u64,

    /// Windows the tier finished without handing anything on (for Tier C:
    /// windows that produced facts instead of a dead letter)
    pub resolved: u64,

    pub facts: u64,
    pub total_latency: Duration,
}

impl TierStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.windows == 0 {
            return 0.0;
        }
        self.resolved as f64 / self.windows as f64
    }

    pub fn mean_latency(&self) -> Duration {
        if self.windows == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.windows as u32
    }
}

// =========================================================================
// Reports
// =========================================================================

/// Operator view of the pipeline (`extract status`).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub extractor_version: String,
    pub dlq_pending: usize,
    pub dlq_failed: usize,
    pub cache: CacheStats,
    pub inference_calls: u64,
    pub tiers: Vec<TierStats>,
    pub writer: BatchWriteResult,
    pub buffered_facts: usize,
}

/// Outcome of one DLQ sweep (`extract pending`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub claimed: usize,

    /// Stale claims put back on the schedule before claiming
    pub reclaimed: usize,

    pub recovered: usize,
    pub rescheduled: usize,
    pub permanently_failed: usize,
    pub write: BatchWriteResult,
}

/// Outcome of re-extracting one document (`extract reprocess`).
#[derive(Debug, Clone, PartialEq)]
pub struct ReprocessReport {
    pub doc_id: Uuid,
    pub previous_version: Option<String>,
    pub diff: FactDiff,
    pub write: BatchWriteResult,
}

/// Outcome of [`ExtractionPipeline::run_documents`].
#[derive(Debug, Default)]
pub struct RunReport {
    pub documents: usize,
    pub facts: usize,
    pub failed_windows: usize,
    pub errors: Vec<(Uuid, ExtractionError)>,
    pub write: BatchWriteResult,
}

// =========================================================================
// Pipeline
// =========================================================================

/// Tiered extraction from documents into a property graph.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = ExtractionPipeline::new(config, kv, inference, LexiconNlp::new()?, graph)?;
///
/// let facts = pipeline.ingest_document(&doc, &windows, &cancel).await?;
/// pipeline.flush().await?;
///
/// // later, from a scheduler
/// pipeline.process_pending(Utc::now(), 100).await?;
/// ```
pub struct ExtractionPipeline<K, I, N, G> {
    config: PipelineConfig,
    deterministic: DeterministicExtractor,
    syntactic: SyntacticTier<N>,
    inference: InferenceTier<K, I>,
    dlq: DeadLetterQueue<K>,
    snapshots: FactSnapshotStore<K>,
    writer: BatchGraphWriter<G>,
    /// Snapshots of documents whose facts are not yet known to be committed
    staged: Mutex<IndexMap<Uuid, FactSnapshot>>,
    metrics: TierMetrics,
}

impl<K, I, N, G> ExtractionPipeline<K, I, N, G>
where
    K: KvStore + Clone,
    I: InferenceClient,
    N: SyntacticExtractor,
    G: GraphStore,
{
    /// Assemble a pipeline. `kv` backs the cache, the DLQ and fact snapshots.
    pub fn new(config: PipelineConfig, kv: K, inference: I, nlp: N, graph: G) -> Result<Self> {
        config.validate()?;
        let version = config.extractor_version.clone();

        let deterministic = DeterministicExtractor::new(&config.deterministic, version.clone())
            .map_err(|e| ExtractionError::Config(Box::new(e)))?;
        let syntactic = SyntacticTier::new(nlp, config.escalation.clone(), version.clone());
        let cache = ExtractionCache::new(kv.clone(), config.cache.ttl);
        let inference = InferenceTier::new(cache, inference, config.inference.clone(), version);
        let dlq = DeadLetterQueue::new(kv.clone(), config.dlq.clone());
        let snapshots = FactSnapshotStore::new(kv);
        let writer = BatchGraphWriter::new(graph, config.writer.clone());

        Ok(Self {
            config,
            deterministic,
            syntactic,
            inference,
            dlq,
            snapshots,
            writer,
            staged: Mutex::new(IndexMap::new()),
            metrics: TierMetrics::default(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dlq(&self) -> &DeadLetterQueue<K> {
        &self.dlq
    }

    pub fn writer(&self) -> &BatchGraphWriter<G> {
        &self.writer
    }

    pub fn inference(&self) -> &InferenceTier<K, I> {
        &self.inference
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Run every tier over a document's windows and collect one fact set.
    ///
    /// Nothing is written to the graph. Cancellation stops tier dispatch and
    /// discards everything gathered so far.
    pub async fn process_document(
        &self,
        doc: &Document,
        windows: &[Window],
        cancel: &CancellationToken,
    ) -> Result<FactSet> {
        let started = Instant::now();
        if let Some(foreign) = windows.iter().find(|w| w.doc_id != doc.doc_id) {
            return Err(ExtractionError::ForeignWindow {
                window_id: foreign.window_id,
                doc_id: doc.doc_id,
            });
        }

        let mut set = FactSet::new(doc.doc_id, self.config.extractor_version.clone());
        let mut escalated: Vec<Window> = Vec::new();
        let mut escalated_text: HashSet<String> = HashSet::new();

        for window in windows {
            if cancel.is_cancelled() {
                return Err(ExtractionError::Cancelled);
            }

            let tier_started = Instant::now();
            let output = self.deterministic.extract(window);
            let resolved = output.is_resolved();
            let unresolved = output.unresolved.clone();
            self.metrics
                .tier(Tier::A)
                .record(resolved, output.fact_count(), tier_started.elapsed());
            set.extend(output.into_facts());

            if resolved {
                debug!(doc_id = %doc.doc_id, window_id = %window.window_id, "window resolved by tier A");
                continue;
            }

            let tier_started = Instant::now();
            let output = self.syntactic.extract(window, &unresolved);
            let fact_count = output.entities.len() + output.relationships.len();
            self.metrics
                .tier(Tier::B)
                .record(!output.escalates(), fact_count, tier_started.elapsed());

            for escalation in &output.escalations {
                let sub = window.sub_window(escalation.span);
                if sub.text.trim().is_empty() || !escalated_text.insert(sub.text.clone()) {
                    continue;
                }
                debug!(
                    doc_id = %doc.doc_id,
                    window_id = %window.window_id,
                    reason = ?escalation.reason,
                    "span escalated to tier C"
                );
                escalated.push(sub);
            }
            set.extend(output.into_facts());
        }

        if !escalated.is_empty() {
            let tier_started = Instant::now();
            let outcomes = tokio::select! {
                _ = cancel.cancelled() => return Err(ExtractionError::Cancelled),
                outcomes = self.inference.extract(&escalated) => outcomes
                    .map_err(|e| ExtractionError::infrastructure(doc.doc_id, None, None, e))?,
            };
            let per_window = tier_started.elapsed() / escalated.len() as u32;

            for outcome in outcomes {
                match outcome {
                    WindowOutcome::Extracted { facts, .. } => {
                        self.metrics.tier(Tier::C).record(true, facts.len(), per_window);
                        set.extend(facts);
                    }
                    WindowOutcome::DeadLettered(entry) => {
                        self.metrics.tier(Tier::C).record(false, 0, per_window);
                        set.failed_windows += 1;
                        let window_id = entry.window_id();
                        self.dlq
                            .record_failure(entry, Utc::now())
                            .await
                            .map_err(|e| ExtractionError::infrastructure(doc.doc_id, Some(window_id), Some(0), e))?;
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        info!(
            doc_id = %doc.doc_id,
            windows = windows.len(),
            escalated = escalated.len(),
            facts = set.len(),
            tier_a = set.count_by_tier(Tier::A),
            tier_b = set.count_by_tier(Tier::B),
            tier_c = set.count_by_tier(Tier::C),
            failed_windows = set.failed_windows,
            duration_ms = started.elapsed().as_millis() as u64,
            "document processed"
        );
        Ok(set)
    }

    /// Process a document and hand its facts to the writer buffer.
    ///
    /// The document's snapshot is recorded by the next successful
    /// [`flush`](Self::flush), once its facts are committed. If a batch
    /// commit fails here the error is returned, but the facts stay buffered
    /// and go out with the next flush.
    pub async fn ingest_document(
        &self,
        doc: &Document,
        windows: &[Window],
        cancel: &CancellationToken,
    ) -> Result<FactSet> {
        let set = self.process_document(doc, windows, cancel).await?;
        let facts: Vec<Fact> = set.facts().cloned().collect();

        let enqueued = self.writer.enqueue_document(doc.doc_id, facts, cancel).await;
        if let Err(WriteError::Cancelled(_)) = enqueued {
            return Err(ExtractionError::Cancelled);
        }
        self.stage(FactSnapshot::from_set(&set, Utc::now()));
        enqueued.map_err(|e| ExtractionError::infrastructure(doc.doc_id, None, None, e))?;
        Ok(set)
    }

    /// Commit everything the writer is holding, then record the snapshots of
    /// the documents it belonged to.
    pub async fn flush(&self) -> Result<BatchWriteResult> {
        let staged = std::mem::take(&mut *self.lock_staged());
        let write = match self.writer.flush().await {
            Ok(write) => write,
            Err(e) => {
                self.restage(staged);
                return Err(e.into());
            }
        };

        let mut staged = staged.into_iter();
        while let Some((doc_id, snapshot)) = staged.next() {
            if let Err(e) = self.snapshots.save(&snapshot).await {
                self.restage(std::iter::once((doc_id, snapshot)).chain(staged).collect());
                return Err(ExtractionError::infrastructure(doc_id, None, None, e));
            }
        }
        Ok(write)
    }

    fn lock_staged(&self) -> std::sync::MutexGuard<'_, IndexMap<Uuid, FactSnapshot>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self, snapshot: FactSnapshot) {
        self.lock_staged().insert(snapshot.doc_id, snapshot);
    }

    /// Put snapshots back unless a newer one was staged meanwhile.
    fn restage(&self, snapshots: IndexMap<Uuid, FactSnapshot>) {
        let mut staged = self.lock_staged();
        for (doc_id, snapshot) in snapshots {
            staged.entry(doc_id).or_insert(snapshot);
        }
    }

    /// Ingest many documents on a bounded worker pool, then flush.
    ///
    /// A failing document is recorded in the report and does not stop the
    /// others.
    pub async fn run_documents(
        &self,
        documents: Vec<(Document, Vec<Window>)>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let results: Vec<(Uuid, Result<FactSet>)> = stream::iter(documents)
            .map(|(doc, windows)| async move {
                let result = self.ingest_document(&doc, &windows, cancel).await;
                (doc.doc_id, result)
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut report = RunReport::default();
        for (doc_id, result) in results {
            match result {
                Ok(set) => {
                    report.documents += 1;
                    report.facts += set.len();
                    report.failed_windows += set.failed_windows;
                }
                Err(e) => {
                    warn!(doc_id = %doc_id, error = %e, "document failed");
                    report.errors.push((doc_id, e));
                }
            }
        }
        report.write = self.flush().await?;
        Ok(report)
    }

    // =========================================================================
    // Dead letter queue
    // =========================================================================

    /// Retry dead-lettered windows that are due (`extract pending`).
    ///
    /// Claims that outlived `claim_timeout` are put back on the schedule
    /// first. If the sweep fails part way, every entry it claimed but did
    /// not settle is released so the next sweep picks it up again.
    pub async fn process_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<SweepReport> {
        let reclaimed = self.dlq.reclaim_stale(now, limit).await?;
        let entries = self.dlq.claim_due(now, limit).await?;
        let mut report = SweepReport {
            claimed: entries.len(),
            reclaimed,
            ..SweepReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let hashes: Vec<String> = entries.iter().map(|e| e.content_hash.clone()).collect();
        if let Err(e) = self.retry_claimed(entries, now, &mut report).await {
            for hash in &hashes {
                if let Err(release_error) = self.dlq.release(hash, now).await {
                    warn!(content_hash = %hash, error = %release_error, "could not release claimed window");
                }
            }
            return Err(e);
        }

        info!(
            claimed = report.claimed,
            reclaimed = report.reclaimed,
            recovered = report.recovered,
            rescheduled = report.rescheduled,
            permanently_failed = report.permanently_failed,
            "dead letter sweep complete"
        );
        Ok(report)
    }

    async fn retry_claimed(&self, entries: Vec<DlqEntry>, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        // identical text is one inference item, so waiting windows cost nothing extra
        let windows: Vec<Window> = entries.iter().flat_map(|e| e.windows().cloned()).collect();
        let mut outcomes = self.inference.extract(&windows).await?.into_iter();

        let mut recovered: Vec<(DlqEntry, Vec<Fact>)> = Vec::new();
        for entry in entries {
            let mut facts = Vec::new();
            let mut failed = None;
            for outcome in outcomes.by_ref().take(entry.waiting.len() + 1) {
                match outcome {
                    WindowOutcome::Extracted { facts: extracted, .. } => facts.extend(extracted),
                    WindowOutcome::DeadLettered(dead) => {
                        failed.get_or_insert((dead.failure, dead.error));
                    }
                }
            }

            let Some((failure, error)) = failed else {
                recovered.push((entry, facts));
                continue;
            };
            let context = (entry.doc_id(), entry.window_id(), entry.retry_count);
            let entry = self
                .dlq
                .mark_retry_failed(entry, failure, error, now)
                .await
                .map_err(|e| ExtractionError::infrastructure(context.0, Some(context.1), Some(context.2), e))?;
            if entry.state == DlqState::PermanentlyFailed {
                report.permanently_failed += 1;
            } else {
                report.rescheduled += 1;
            }
        }

        if recovered.is_empty() {
            return Ok(());
        }
        let facts: Vec<Fact> = recovered.iter().flat_map(|(_, facts)| facts.iter().cloned()).collect();
        report.write = self.writer.write_batch(&facts).await?;
        for (entry, _) in &recovered {
            self.dlq.mark_succeeded(entry, now).await.map_err(|e| {
                ExtractionError::infrastructure(entry.doc_id(), Some(entry.window_id()), Some(entry.retry_count), e)
            })?;
            report.recovered += 1;
        }
        Ok(())
    }

    /// Sweep the DLQ every `interval` until cancelled.
    pub async fn run_sweeper(&self, interval: Duration, limit: usize, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dead letter sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.process_pending(Utc::now(), limit).await {
                        error!(error = %e, "dead letter sweep failed");
                    }
                }
            }
        }
    }

    // =========================================================================
    // Reprocessing
    // =========================================================================

    /// Re-extract a document and commit only what changed since its last run.
    pub async fn reprocess(
        &self,
        doc: &Document,
        windows: &[Window],
        cancel: &CancellationToken,
    ) -> Result<ReprocessReport> {
        let current = self.process_document(doc, windows, cancel).await?;
        let infrastructure = |e: crate::error::StoreError| ExtractionError::infrastructure(doc.doc_id, None, None, e);

        let previous = self.snapshots.load(doc.doc_id).await.map_err(infrastructure)?;
        let previous_version = previous.as_ref().map(|s| s.extractor_version.clone());
        let changes = match previous {
            Some(snapshot) => diff(&snapshot.into_set(), &current),
            None => FactDiff {
                added: current.facts().cloned().collect(),
                ..FactDiff::default()
            },
        };

        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        let to_commit = changes.to_commit();
        let write = if to_commit.is_empty() {
            BatchWriteResult::default()
        } else {
            self.writer
                .write_batch(&to_commit)
                .await
                .map_err(|e| ExtractionError::infrastructure(doc.doc_id, None, None, e))?
        };
        self.snapshots
            .save(&FactSnapshot::from_set(&current, Utc::now()))
            .await
            .map_err(infrastructure)?;

        if !changes.removed.is_empty() {
            warn!(
                doc_id = %doc.doc_id,
                removed = changes.removed.len(),
                "facts no longer extracted; left in graph"
            );
        }
        info!(
            doc_id = %doc.doc_id,
            previous_version = ?previous_version,
            added = changes.added.len(),
            rescored = changes.confidence_changed.len(),
            removed = changes.removed.len(),
            "document reprocessed"
        );

        Ok(ReprocessReport {
            doc_id: doc.doc_id,
            previous_version,
            diff: changes,
            write,
        })
    }

    /// Documents processed within the last `window` (`extract reprocess --since`).
    pub async fn documents_processed_since(&self, window: Duration, limit: usize) -> Result<Vec<Uuid>> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| ExtractionError::Config(Box::new(e)))?;
        Ok(self.snapshots.processed_since(Utc::now() - window, limit).await?)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Operator snapshot (`extract status`).
    pub async fn status(&self) -> Result<PipelineStatus> {
        Ok(PipelineStatus {
            extractor_version: self.config.extractor_version.clone(),
            dlq_pending: self.dlq.pending_count().await?,
            dlq_failed: self.dlq.failed_count().await?,
            cache: self.inference.cache().stats(),
            inference_calls: self.inference.calls(),
            tiers: Tier::ALL
                .iter()
                .map(|tier| self.metrics.tier(*tier).snapshot(*tier))
                .collect(),
            writer: self.writer.totals(),
            buffered_facts: self.writer.buffered(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::lexicon::LexiconNlp;
    use crate::stores::{MemoryGraphStore, MemoryKvStore};
    use crate::testing::MockInference;
    use crate::types::document::SourceType;
    use std::sync::Arc;

    type TestPipeline = ExtractionPipeline<Arc<MemoryKvStore>, Arc<MockInference>, LexiconNlp, Arc<MemoryGraphStore>>;

    fn pipeline(inference: Arc<MockInference>) -> (TestPipeline, Arc<MemoryGraphStore>) {
        let graph = Arc::new(MemoryGraphStore::new());
        let pipeline = ExtractionPipeline::new(
            PipelineConfig::default(),
            Arc::new(MemoryKvStore::new()),
            inference,
            LexiconNlp::new().unwrap(),
            graph.clone(),
        )
        .unwrap();
        (pipeline, graph)
    }

    fn document(text: &str) -> (Document, Vec<Window>) {
        let doc = Document::new(SourceType::Config, text);
        let windows = vec![Window::new(doc.doc_id, text, 0)];
        (doc, windows)
    }

    #[tokio::test]
    async fn test_structured_window_stops_at_tier_a() {
        let inference = Arc::new(MockInference::new());
        let (pipeline, _) = pipeline(inference.clone());
        let (doc, windows) = document("services:\n  web:\n    depends_on:\n      - db\n  db:\n    image: postgres\n");

        let set = pipeline
            .process_document(&doc, &windows, &CancellationToken::new())
            .await
            .unwrap();
        assert!(set.len() >= 3);
        assert_eq!(set.count_by_tier(Tier::A), set.len());
        assert_eq!(inference.calls(), 0);

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.tiers[0].windows, 1);
        assert_eq!(status.tiers[0].resolved, 1);
        assert_eq!(status.tiers[1].windows, 0);
    }

    #[tokio::test]
    async fn test_foreign_window_is_rejected() {
        let (pipeline, _) = pipeline(Arc::new(MockInference::new()));
        let (doc, _) = document("x");
        let stray = Window::new(Uuid::new_v4(), "x", 0);
        let err = pipeline
            .process_document(&doc, &[stray], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::ForeignWindow { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_document_yields_nothing() {
        let inference = Arc::new(MockInference::new());
        let (pipeline, graph) = pipeline(inference.clone());
        let (doc, windows) = document("nginx talks to postgres over a tunnel.");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.ingest_document(&doc, &windows, &cancel).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Cancelled));
        pipeline.flush().await.unwrap();
        assert_eq!(graph.node_count(), 0);
        assert_eq!(inference.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_window_is_counted_not_fatal() {
        let inference = Arc::new(MockInference::new());
        inference.fail_all(crate::error::InferenceError::Transport("down".into()));
        let (pipeline, _) = pipeline(inference.clone());
        let (doc, windows) = document("nginx talks to postgres over a tunnel.");

        let set = pipeline
            .process_document(&doc, &windows, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(set.failed_windows, 1);
        // dictionary hits from tier A outrank tier B's mentions of the same services
        assert_eq!(set.count_by_tier(Tier::A), 2);

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.dlq_pending, 1);
        assert_eq!(status.tiers[1].windows, 1);
        assert_eq!(status.tiers[2].resolved, 0);
    }

    #[test]
    fn test_tier_stats_ratios() {
        let counter = TierCounter::default();
        counter.record(true, 3, Duration::from_millis(10));
        counter.record(false, 0, Duration::from_millis(30));
        let stats = counter.snapshot(Tier::B);
        assert_eq!(stats.hit_ratio(), 0.5);
        assert_eq!(stats.mean_latency(), Duration::from_millis(20));
        assert_eq!(stats.facts, 3);
    }
}
