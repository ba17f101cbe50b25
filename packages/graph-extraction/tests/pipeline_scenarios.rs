//! End-to-end scenarios for the tiered pipeline against in-memory stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use graph_extraction::ai::LexiconNlp;
use graph_extraction::error::StoreResult;
use graph_extraction::pipeline::cache_key;
use graph_extraction::testing::{document, service_facts};
use graph_extraction::{
    DeterministicExtractor, DlqState, ExtractionCache, ExtractionPipeline, FailureKind, FlakyGraphStore, GraphBatch,
    GraphError, GraphStore, InferenceConfig, InferenceError, InferenceTier, KvStore, MemoryGraphStore, MemoryKvStore,
    MockInference, NodeKey, PipelineConfig, RelKind, SourceType, StoreError, Tier, Window, WindowOutcome,
};
use proptest::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type TestPipeline = ExtractionPipeline<Arc<MemoryKvStore>, Arc<MockInference>, LexiconNlp, Arc<MemoryGraphStore>>;

const COMPOSE: &str = "services:\n  nginx:\n    image: nginx:1.25\n    ports:\n      - \"80:80\"\n    depends_on:\n      - postgres\n  postgres:\n    image: postgres:16\n    ports:\n      - \"5432:5432\"\n";

const PROSE: &str = "nginx talks to postgres over a private link.";

struct Harness {
    pipeline: TestPipeline,
    kv: Arc<MemoryKvStore>,
    inference: Arc<MockInference>,
    graph: Arc<MemoryGraphStore>,
}

fn harness_with(config: PipelineConfig, inference: MockInference) -> Harness {
    let kv = Arc::new(MemoryKvStore::new());
    let inference = Arc::new(inference);
    let graph = Arc::new(MemoryGraphStore::new());
    let pipeline = ExtractionPipeline::new(
        config,
        kv.clone(),
        inference.clone(),
        LexiconNlp::new().unwrap(),
        graph.clone(),
    )
    .unwrap();
    Harness {
        pipeline,
        kv,
        inference,
        graph,
    }
}

fn harness(inference: MockInference) -> Harness {
    harness_with(PipelineConfig::default(), inference)
}

fn connects_reply() -> MockInference {
    MockInference::new().with_reply(
        "talks to",
        &[("Service", "nginx"), ("Service", "postgres")],
        &[("CONNECTS_TO", "nginx", "postgres")],
    )
}

#[tokio::test]
async fn test_compose_block_is_handled_by_tier_a_alone() {
    let h = harness(MockInference::new());
    let (doc, windows) = document(SourceType::Config, COMPOSE);

    let set = h
        .pipeline
        .process_document(&doc, &windows, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(set.entities().count(), 2);
    let rels: Vec<_> = set.relationships().collect();
    assert_eq!(rels.iter().filter(|r| r.kind == RelKind::BindsPort).count(), 2);
    assert_eq!(rels.iter().filter(|r| r.kind == RelKind::DependsOn).count(), 1);
    assert_eq!(rels.len(), 3);
    assert!(set.facts().all(|f| f.tier() == Tier::A && f.confidence().value() == 1.0));
    assert_eq!(h.inference.calls(), 0);
}

#[tokio::test]
async fn test_rerunning_unchanged_document_creates_nothing() {
    let h = harness(connects_reply());
    let text = format!("{}\n\n{}", COMPOSE.trim_end(), PROSE);
    let (doc, windows) = document(SourceType::Markdown, &text);
    let cancel = CancellationToken::new();

    h.pipeline.ingest_document(&doc, &windows, &cancel).await.unwrap();
    let first = h.pipeline.flush().await.unwrap();
    assert!(first.created() > 0);
    let (nodes, edges) = (h.graph.node_count(), h.graph.edge_count());

    h.pipeline.ingest_document(&doc, &windows, &cancel).await.unwrap();
    let second = h.pipeline.flush().await.unwrap();
    assert_eq!(second.created(), 0);
    assert_eq!(h.graph.node_count(), nodes);
    assert_eq!(h.graph.edge_count(), edges);

    let report = h.pipeline.reprocess(&doc, &windows, &cancel).await.unwrap();
    assert!(report.diff.is_empty());
    assert_eq!(report.write.commits, 0);
    assert_eq!(report.previous_version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_escalated_sentence_is_sent_once() {
    let h = harness(connects_reply());
    // the same sentence in two paragraphs is still one inference item
    let text = format!("{}\n\n{}", PROSE, PROSE);
    let (doc, windows) = document(SourceType::Text, &text);
    assert_eq!(windows.len(), 2);

    let set = h
        .pipeline
        .process_document(&doc, &windows, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.inference.requests(), vec![vec![PROSE.to_string()]]);
    let rel = set.relationships().next().unwrap();
    assert_eq!(rel.kind, RelKind::ConnectsTo);
    assert_eq!(rel.provenance.tier, Tier::C);
    assert_eq!(rel.provenance.doc_id, doc.doc_id);
}

#[tokio::test]
async fn test_second_extraction_is_served_from_cache() {
    let h = harness(connects_reply());
    let cancel = CancellationToken::new();

    let (first_doc, first_windows) = document(SourceType::Text, PROSE);
    let (second_doc, second_windows) = document(SourceType::Text, PROSE);
    let first = h.pipeline.process_document(&first_doc, &first_windows, &cancel).await.unwrap();
    let second = h.pipeline.process_document(&second_doc, &second_windows, &cancel).await.unwrap();

    assert_eq!(h.inference.calls(), 1);
    assert_eq!(first.count_by_tier(Tier::C), second.count_by_tier(Tier::C));
    // provenance follows the document, not the cached entry
    assert!(second.relationships().all(|r| r.provenance.doc_id == second_doc.doc_id));

    let status = h.pipeline.status().await.unwrap();
    assert_eq!(status.cache.hits, 1);
    assert_eq!(status.cache.misses, 1);
}

#[tokio::test]
async fn test_new_extractor_version_bypasses_cache() {
    let kv = Arc::new(MemoryKvStore::new());
    let inference = Arc::new(connects_reply());
    let cancel = CancellationToken::new();

    for version in ["1.0.0", "1.1.0"] {
        let pipeline: TestPipeline = ExtractionPipeline::new(
            PipelineConfig::default().with_extractor_version(version),
            kv.clone(),
            inference.clone(),
            LexiconNlp::new().unwrap(),
            Arc::new(MemoryGraphStore::new()),
        )
        .unwrap();
        let (doc, windows) = document(SourceType::Text, PROSE);
        pipeline.process_document(&doc, &windows, &cancel).await.unwrap();
    }

    assert_eq!(inference.calls(), 2);
    let cache = ExtractionCache::new(kv.clone(), Duration::from_secs(60));
    let old = cache.meta(&cache_key(PROSE, "1.0.0")).await.unwrap().unwrap();
    let new = cache.meta(&cache_key(PROSE, "1.1.0")).await.unwrap().unwrap();
    assert_eq!(old.extractor_version, "1.0.0");
    assert_eq!(new.extractor_version, "1.1.0");
}

#[tokio::test]
async fn test_oversized_window_fails_permanently_without_inference() {
    let mut config = PipelineConfig::default();
    config.inference.max_window_tokens = 4;
    let h = harness_with(config, connects_reply());
    let (doc, windows) = document(SourceType::Text, PROSE);

    let set = h
        .pipeline
        .process_document(&doc, &windows, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(set.failed_windows, 1);
    assert_eq!(h.inference.calls(), 0);

    let failed = h
        .pipeline
        .dlq()
        .failed(&cache_key(PROSE, "1.0.0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.state, DlqState::PermanentlyFailed);
    assert_eq!(failed.failure, FailureKind::NonRetryable);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(h.pipeline.dlq().pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retries_stop_at_three() {
    let h = harness(connects_reply());
    h.inference.fail_all(InferenceError::Transport("connection reset".into()));
    let (doc, windows) = document(SourceType::Text, PROSE);
    h.pipeline
        .process_document(&doc, &windows, &CancellationToken::new())
        .await
        .unwrap();

    let mut now = Utc::now();
    let mut permanently_failed = 0;
    for _ in 0..6 {
        now += chrono::Duration::hours(1);
        permanently_failed += h.pipeline.process_pending(now, 10).await.unwrap().permanently_failed;
    }

    assert_eq!(permanently_failed, 1);
    // one first attempt plus three retries
    assert_eq!(h.inference.calls(), 4);
    let failed = h
        .pipeline
        .dlq()
        .failed(&cache_key(PROSE, "1.0.0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.retry_count, 3);
    assert_eq!(failed.history.len(), 4);
}

#[tokio::test]
async fn test_recovered_window_is_written_and_cleared() {
    let h = harness(connects_reply());
    h.inference.fail_all(InferenceError::RateLimited);
    let (doc, windows) = document(SourceType::Text, PROSE);
    h.pipeline
        .ingest_document(&doc, &windows, &CancellationToken::new())
        .await
        .unwrap();
    h.pipeline.flush().await.unwrap();
    assert_eq!(h.graph.edge_count(), 0);

    h.inference.recover();
    // not due yet
    let early = h.pipeline.process_pending(Utc::now(), 10).await.unwrap();
    assert_eq!(early.claimed, 0);

    let report = h
        .pipeline
        .process_pending(Utc::now() + chrono::Duration::seconds(2), 10)
        .await
        .unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.write.edges_written, 1);
    assert_eq!(h.graph.edge_count(), 1);
    assert_eq!(h.pipeline.dlq().pending_count().await.unwrap(), 0);
    assert!(h.pipeline.dlq().get(&cache_key(PROSE, "1.0.0")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sweeper_recovers_in_background() {
    let mut config = PipelineConfig::default();
    config.dlq.backoff_base = Duration::from_millis(10);
    let h = harness_with(config, connects_reply());
    h.inference.fail_all(InferenceError::Transport("down".into()));
    let (doc, windows) = document(SourceType::Text, PROSE);
    h.pipeline
        .process_document(&doc, &windows, &CancellationToken::new())
        .await
        .unwrap();
    h.inference.recover();

    let pipeline = Arc::new(h.pipeline);
    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn({
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        async move { pipeline.run_sweeper(Duration::from_millis(20), 10, cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    sweeper.await.unwrap();

    assert_eq!(pipeline.dlq().pending_count().await.unwrap(), 0);
    assert_eq!(h.graph.edge_count(), 1);
}

#[tokio::test]
async fn test_five_thousand_facts_take_three_commits() {
    let h = harness(MockInference::new());
    let result = h
        .pipeline
        .writer()
        .write_batch(&service_facts(Uuid::new_v4(), 5_000))
        .await
        .unwrap();
    assert_eq!(result.commits, 3);
    assert_eq!(result.rows_written, 5_000);
    assert_eq!(h.graph.node_count(), 5_000);
}

#[tokio::test]
async fn test_run_documents_reports_per_document_failures() {
    let h = harness(connects_reply());
    let (good, good_windows) = document(SourceType::Config, COMPOSE);
    let (bad, _) = document(SourceType::Text, PROSE);
    let stray = vec![Window::new(Uuid::new_v4(), PROSE, 0)];

    let report = h
        .pipeline
        .run_documents(vec![(good, good_windows), (bad.clone(), stray)], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.documents, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, bad.doc_id);
    assert_eq!(report.write.rows_written, report.facts);
    assert_eq!(h.graph.node_count(), 4);

    let since = h
        .pipeline
        .documents_processed_since(Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert_eq!(since.len(), 1);
    assert!(h.kv.key_count() > 0);
}

const SECOND_COMPOSE: &str = "services:\n  redis:\n    ports:\n      - \"6379:6379\"\n    depends_on:\n      - kafka\n  kafka:\n    image: kafka:3\n";

#[tokio::test]
async fn test_failed_commit_keeps_every_buffered_document() {
    let graph = Arc::new(FlakyGraphStore::new());
    let mut config = PipelineConfig::default();
    config.writer = config.writer.with_batch_size(8);
    let pipeline: ExtractionPipeline<_, _, _, Arc<FlakyGraphStore>> = ExtractionPipeline::new(
        config,
        Arc::new(MemoryKvStore::new()),
        Arc::new(MockInference::new()),
        LexiconNlp::new().unwrap(),
        graph.clone(),
    )
    .unwrap();
    let cancel = CancellationToken::new();

    let (first, first_windows) = document(SourceType::Config, COMPOSE);
    let first_set = pipeline.ingest_document(&first, &first_windows, &cancel).await.unwrap();
    assert_eq!(pipeline.writer().buffered(), first_set.len());

    // the second document fills a batch that mixes both documents' facts
    graph.reject_next(GraphError::Unavailable("connection reset".into()));
    let (second, second_windows) = document(SourceType::Config, SECOND_COMPOSE);
    assert!(pipeline.ingest_document(&second, &second_windows, &cancel).await.is_err());
    assert_eq!(graph.inner().node_count(), 0);
    let buffered = pipeline.writer().buffered();
    assert!(buffered > first_set.len());

    // nothing counts as processed until its facts are committed
    let since = pipeline.documents_processed_since(Duration::from_secs(60), 10).await.unwrap();
    assert!(since.is_empty());

    let write = pipeline.flush().await.unwrap();
    assert_eq!(write.rows_written, buffered);
    assert_eq!(pipeline.writer().buffered(), 0);
    for service in ["nginx", "postgres", "redis", "kafka"] {
        assert!(graph.inner().node(&NodeKey::service(service)).is_some(), "{} missing", service);
    }

    let since = pipeline.documents_processed_since(Duration::from_secs(60), 10).await.unwrap();
    assert_eq!(since.len(), 2);
    let report = pipeline.reprocess(&first, &first_windows, &cancel).await.unwrap();
    assert_eq!(report.previous_version.as_deref(), Some("1.0.0"));
    assert!(report.diff.is_empty());
}

#[tokio::test]
async fn test_failed_flush_records_no_snapshot() {
    let graph = Arc::new(FlakyGraphStore::new());
    let pipeline: ExtractionPipeline<_, _, _, Arc<FlakyGraphStore>> = ExtractionPipeline::new(
        PipelineConfig::default(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(MockInference::new()),
        LexiconNlp::new().unwrap(),
        graph.clone(),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let (doc, windows) = document(SourceType::Config, COMPOSE);
    pipeline.ingest_document(&doc, &windows, &cancel).await.unwrap();

    graph.reject_next(GraphError::Unavailable("down".into()));
    assert!(pipeline.flush().await.is_err());
    let since = pipeline.documents_processed_since(Duration::from_secs(60), 10).await.unwrap();
    assert!(since.is_empty());

    pipeline.flush().await.unwrap();
    let since = pipeline.documents_processed_since(Duration::from_secs(60), 10).await.unwrap();
    assert_eq!(since, vec![doc.doc_id]);
}

/// Memory store whose extraction cache reads fail while `cache_down` is set.
#[derive(Default)]
struct FlakyCacheKv {
    inner: MemoryKvStore,
    cache_down: AtomicBool,
}

#[async_trait]
impl KvStore for FlakyCacheKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        if self.cache_down.load(Ordering::SeqCst) && key.starts_with("extraction:") {
            return Err(StoreError::Unavailable("cache offline".into()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.set(key, value).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.inner.del(key).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.inner.incr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        self.inner.scan_prefix(prefix, limit).await
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()> {
        self.inner.zadd(set, member, score).await
    }

    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool> {
        self.inner.zrem(set, member).await
    }

    async fn zrange_by_score(&self, set: &str, min: f64, max: f64, limit: usize) -> StoreResult<Vec<(String, f64)>> {
        self.inner.zrange_by_score(set, min, max, limit).await
    }

    async fn zcard(&self, set: &str) -> StoreResult<usize> {
        self.inner.zcard(set).await
    }
}

#[tokio::test]
async fn test_claimed_entry_survives_a_store_failure() {
    let kv = Arc::new(FlakyCacheKv::default());
    let inference = Arc::new(connects_reply());
    let graph = Arc::new(MemoryGraphStore::new());
    let pipeline = ExtractionPipeline::new(
        PipelineConfig::default(),
        kv.clone(),
        inference.clone(),
        LexiconNlp::new().unwrap(),
        graph.clone(),
    )
    .unwrap();
    let hash = cache_key(PROSE, "1.0.0");

    inference.fail_all(InferenceError::Transport("connection reset".into()));
    let (doc, windows) = document(SourceType::Text, PROSE);
    pipeline
        .process_document(&doc, &windows, &CancellationToken::new())
        .await
        .unwrap();
    inference.recover();

    let now = Utc::now() + chrono::Duration::seconds(2);
    kv.cache_down.store(true, Ordering::SeqCst);
    assert!(pipeline.process_pending(now, 10).await.is_err());
    kv.cache_down.store(false, Ordering::SeqCst);

    // released, not lost, and the failed sweep did not use up a retry
    assert_eq!(pipeline.dlq().pending_count().await.unwrap(), 1);
    let entry = pipeline.dlq().get(&hash).await.unwrap().unwrap();
    assert_eq!(entry.state, DlqState::Pending);
    assert_eq!(entry.retry_count, 0);

    let report = pipeline
        .process_pending(now + chrono::Duration::seconds(5), 10)
        .await
        .unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(graph.edge_count(), 1);
    assert!(pipeline.dlq().get(&hash).await.unwrap().is_none());
}

#[tokio::test]
async fn test_recovery_reaches_every_document_with_the_same_text() {
    let h = harness(connects_reply());
    h.inference.fail_all(InferenceError::RateLimited);
    let cancel = CancellationToken::new();

    let (first, first_windows) = document(SourceType::Text, PROSE);
    let (second, second_windows) = document(SourceType::Text, PROSE);
    for (doc, windows) in [(&first, &first_windows), (&second, &second_windows)] {
        let set = h.pipeline.process_document(doc, windows, &cancel).await.unwrap();
        assert_eq!(set.failed_windows, 1);
    }
    assert_eq!(h.pipeline.dlq().pending_count().await.unwrap(), 1);
    let queued = h.pipeline.dlq().get(&cache_key(PROSE, "1.0.0")).await.unwrap().unwrap();
    assert_eq!(queued.waiting.len(), 1);

    h.inference.recover();
    let calls_before = h.inference.calls();
    let report = h
        .pipeline
        .process_pending(Utc::now() + chrono::Duration::seconds(2), 10)
        .await
        .unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(h.inference.calls(), calls_before + 1);

    let edge = h
        .graph
        .edge(RelKind::ConnectsTo, &NodeKey::service("nginx"), &NodeKey::service("postgres"))
        .unwrap();
    let mut sources: Vec<_> = edge.sources.iter().map(|s| s.doc_id).collect();
    sources.sort();
    let mut expected = vec![first.doc_id, second.doc_id];
    expected.sort();
    assert_eq!(sources, expected);
}

#[tokio::test]
async fn test_out_of_order_batches_keep_updated_at_after_created_at() {
    let graph = MemoryGraphStore::new();
    let facts = service_facts(Uuid::new_v4(), 3);
    let t1 = Utc::now();

    graph.merge_batch(&GraphBatch::from_facts(&facts, t1)).await.unwrap();
    graph
        .merge_batch(&GraphBatch::from_facts(&facts, t1 - chrono::Duration::seconds(5)))
        .await
        .unwrap();

    for i in 0..3 {
        let node = graph.node(&NodeKey::service(&format!("svc-{}", i))).unwrap();
        assert!(node.updated_at >= node.created_at);
        assert_eq!(node.updated_at, t1);
    }
}

fn compose_for(services: &[String]) -> String {
    let mut text = String::from("services:\n");
    for (i, name) in services.iter().enumerate() {
        text.push_str(&format!("  {}:\n    ports:\n      - \"{}:{}\"\n", name, 8000 + i, 8000 + i));
        if let Some(next) = services.get(i + 1) {
            text.push_str(&format!("    depends_on:\n      - {}\n", next));
        }
    }
    text
}

proptest! {
    #[test]
    fn prop_tier_a_output_is_byte_identical(names in prop::collection::btree_set("[a-z][a-z0-9]{2,8}", 1..6)) {
        let names: Vec<String> = names.into_iter().collect();
        let text = compose_for(&names);
        let window = Window::new(Uuid::new_v4(), text, 0);
        let config = PipelineConfig::default();

        let first = DeterministicExtractor::new(&config.deterministic, "1.0.0").unwrap().extract(&window);
        let second = DeterministicExtractor::new(&config.deterministic, "1.0.0").unwrap().extract(&window);

        prop_assert_eq!(
            serde_json::to_string(&first.into_facts()).unwrap(),
            serde_json::to_string(&second.into_facts()).unwrap()
        );
    }

    #[test]
    fn prop_model_confidence_never_escapes_unit_range(confidence in -2.0f64..3.0) {
        let window = Window::new(Uuid::new_v4(), "billing calls ledger nightly", 0);
        let reply = json!({
            "entities": [
                {"type": "Service", "name": "billing", "properties": {"confidence": confidence}},
                {"type": "Service", "name": "ledger", "properties": {}}
            ],
            "relations": [
                {"type": "CALLS", "src": "billing", "dst": "ledger", "properties": {"confidence": confidence}}
            ],
            "provenance": {"doc_id": window.doc_id.to_string(), "section": null, "span": [window.span.start, window.span.end]}
        });
        let inference = MockInference::new().with_raw_reply("billing", reply.to_string());
        let tier = InferenceTier::new(
            ExtractionCache::new(MemoryKvStore::new(), Duration::from_secs(60)),
            inference,
            InferenceConfig::default(),
            "1.0.0",
        );

        let outcomes = tokio_test::block_on(tier.extract(std::slice::from_ref(&window))).unwrap();
        match &outcomes[0] {
            WindowOutcome::Extracted { facts, .. } => {
                prop_assert!((0.0..=1.0).contains(&confidence));
                for fact in facts {
                    let value = fact.confidence().value();
                    prop_assert!((0.0..=1.0).contains(&value));
                }
            }
            WindowOutcome::DeadLettered(entry) => {
                prop_assert!(!(0.0..=1.0).contains(&confidence));
                prop_assert_eq!(entry.failure, FailureKind::SchemaInvalid);
            }
        }
    }

    #[test]
    fn prop_prose_facts_stay_in_unit_range(words in prop::collection::vec(
        prop::sample::select(vec![
            "nginx", "redis", "postgres", "api", "depends", "on", "talks", "to", "runs", "uses",
            "10.0.0.1", "port", "8080", "the", "and", "via", "https://api.internal/v1", ".",
        ]),
        1..30,
    )) {
        let text = words.join(" ");
        let h = harness(MockInference::new());
        let (doc, windows) = document(SourceType::Text, &text);

        let set = tokio_test::block_on(h.pipeline.process_document(&doc, &windows, &CancellationToken::new())).unwrap();
        for fact in set.facts() {
            let value = fact.confidence().value();
            prop_assert!((0.0..=1.0).contains(&value));
        }
    }
}
