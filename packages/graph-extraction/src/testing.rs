//! Testing utilities including mock implementations.
//!
//! These are useful for testing applications that use the extraction library
//! without making real inference calls or running a graph database.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::error::{GraphError, GraphResult, InferenceError};
use crate::stores::MemoryGraphStore;
use crate::traits::graph::{GraphBatch, GraphStore};
use crate::traits::inference::{InferenceClient, InferenceItem, InferenceReply, InferenceRequest};
use crate::types::document::{Document, SourceType, Span, Window};
use crate::types::fact::{
    Confidence, ExtractedEntity, ExtractedRelationship, Fact, NodeKey, Provenance, RelKind, Tier,
};
use crate::types::write::MergeStats;

/// Build a schema-valid reply for `item`.
///
/// `entities` are `(type, name)` pairs, `relations` are `(type, src, dst)`.
pub fn reply_json(item: &InferenceItem, entities: &[(&str, &str)], relations: &[(&str, &str, &str)]) -> String {
    json!({
        "entities": entities
            .iter()
            .map(|(kind, name)| json!({"type": kind, "name": name, "properties": {}}))
            .collect::<Vec<_>>(),
        "relations": relations
            .iter()
            .map(|(kind, src, dst)| json!({"type": kind, "src": src, "dst": dst, "properties": {}}))
            .collect::<Vec<_>>(),
        "provenance": {
            "doc_id": item.doc_id.to_string(),
            "section": item.section,
            "span": [item.span.start, item.span.end],
        }
    })
    .to_string()
}

#[derive(Debug, Clone)]
enum ScriptedReply {
    Facts {
        entities: Vec<(String, String)>,
        relations: Vec<(String, String, String)>,
    },
    Raw(String),
    Error(InferenceError),
}

/// A mock inference client for testing.
///
/// Replies are scripted by text fragment: the first script whose fragment
/// occurs in an item's text answers it. Unscripted items get a valid, empty
/// reply. Every call is recorded.
#[derive(Default)]
pub struct MockInference {
    scripts: RwLock<Vec<(String, ScriptedReply)>>,

    /// Fails every call while set
    failure: RwLock<Option<InferenceError>>,

    latency: RwLock<Option<Duration>>,

    /// Item texts of every call, in call order
    requests: RwLock<Vec<Vec<String>>>,
}

impl MockInference {
    /// Create a mock that answers everything with an empty extraction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer items containing `fragment` with these entities and relations.
    pub fn with_reply(
        self,
        fragment: impl Into<String>,
        entities: &[(&str, &str)],
        relations: &[(&str, &str, &str)],
    ) -> Self {
        let reply = ScriptedReply::Facts {
            entities: entities.iter().map(|(k, n)| (k.to_string(), n.to_string())).collect(),
            relations: relations
                .iter()
                .map(|(k, s, d)| (k.to_string(), s.to_string(), d.to_string()))
                .collect(),
        };
        self.script(fragment, reply)
    }

    /// Answer items containing `fragment` with raw (possibly invalid) text.
    pub fn with_raw_reply(self, fragment: impl Into<String>, raw: impl Into<String>) -> Self {
        self.script(fragment, ScriptedReply::Raw(raw.into()))
    }

    /// Fail items containing `fragment` with `error`.
    pub fn with_item_error(self, fragment: impl Into<String>, error: InferenceError) -> Self {
        self.script(fragment, ScriptedReply::Error(error))
    }

    /// Delay every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = Some(latency);
        self
    }

    fn script(self, fragment: impl Into<String>, reply: ScriptedReply) -> Self {
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((fragment.into(), reply));
        self
    }

    /// Fail every call with `error` until [`MockInference::recover`].
    pub fn fail_all(&self, error: InferenceError) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of `infer_batch` calls made.
    pub fn calls(&self) -> usize {
        self.requests.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Item texts of every call made.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Total items sent across all calls.
    pub fn items_sent(&self) -> usize {
        self.requests().iter().map(Vec::len).sum()
    }

    fn answer(&self, item: &InferenceItem) -> InferenceReply {
        let scripts = self.scripts.read().unwrap_or_else(PoisonError::into_inner);
        let Some((_, reply)) = scripts.iter().find(|(fragment, _)| item.text.contains(fragment.as_str())) else {
            return Ok(reply_json(item, &[], &[]));
        };
        match reply {
            ScriptedReply::Facts { entities, relations } => {
                let entities: Vec<(&str, &str)> = entities.iter().map(|(k, n)| (k.as_str(), n.as_str())).collect();
                let relations: Vec<(&str, &str, &str)> = relations
                    .iter()
                    .map(|(k, s, d)| (k.as_str(), s.as_str(), d.as_str()))
                    .collect();
                Ok(reply_json(item, &entities, &relations))
            }
            ScriptedReply::Raw(raw) => Ok(raw.clone()),
            ScriptedReply::Error(e) => Err(e.clone()),
        }
    }
}

#[async_trait]
impl InferenceClient for MockInference {
    async fn infer_batch(&self, request: &InferenceRequest) -> Result<Vec<InferenceReply>, InferenceError> {
        self.requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.items.iter().map(|item| item.text.clone()).collect());

        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self.failure.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(request.items.iter().map(|item| self.answer(item)).collect())
    }
}

#[derive(Default)]
struct FlakyState {
    conflicts_left: u32,
    conflict_above: Option<usize>,
    reject: Option<GraphError>,
    latency: Option<Duration>,
}

/// In-memory graph store with injectable write conflicts, rejections and
/// latency.
#[derive(Default)]
pub struct FlakyGraphStore {
    inner: MemoryGraphStore,
    state: Mutex<FlakyState>,
    calls: AtomicUsize,
}

impl FlakyGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store holding whatever was committed.
    pub fn inner(&self) -> &MemoryGraphStore {
        &self.inner
    }

    /// `merge_batch` calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Report a write conflict for the next `n` calls.
    pub fn fail_next(&self, n: u32) {
        self.state().conflicts_left = n;
    }

    /// Report a write conflict for every batch larger than `rows`.
    pub fn conflict_above(&self, rows: usize) {
        self.state().conflict_above = Some(rows);
    }

    /// Fail the next call with `error`.
    pub fn reject_next(&self, error: GraphError) {
        self.state().reject = Some(error);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FlakyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl GraphStore for FlakyGraphStore {
    async fn merge_batch(&self, batch: &GraphBatch) -> GraphResult<MergeStats> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        {
            let mut state = self.state();
            if let Some(error) = state.reject.take() {
                return Err(error);
            }
            if state.conflicts_left > 0 {
                state.conflicts_left -= 1;
                return Err(GraphError::Conflict("injected conflict".into()));
            }
            if state.conflict_above.is_some_and(|rows| batch.len() > rows) {
                return Err(GraphError::Conflict(format!("batch of {} rows deadlocked", batch.len())));
            }
        }

        self.inner.merge_batch(batch).await
    }
}

// =========================================================================
// Fixtures
// =========================================================================

/// Provenance for a hand-built fact.
pub fn provenance(doc_id: Uuid, tier: Tier) -> Provenance {
    Provenance {
        doc_id,
        window_id: Uuid::nil(),
        span: Span::new(0, 10),
        section: None,
        tier,
        extractor_version: "1.0.0".to_string(),
        method: "fixture".to_string(),
    }
}

pub fn entity_fact(doc_id: Uuid, key: NodeKey, tier: Tier, confidence: f64) -> Fact {
    ExtractedEntity::new(key, Confidence::clamped(confidence), provenance(doc_id, tier)).into()
}

/// A relationship between two services.
///
/// Panics if `kind` does not connect services; fixtures only.
pub fn relationship_fact(
    doc_id: Uuid,
    kind: RelKind,
    subject: &str,
    object: &str,
    tier: Tier,
    confidence: f64,
) -> Fact {
    ExtractedRelationship::new(
        kind,
        NodeKey::service(subject),
        NodeKey::service(object),
        Confidence::clamped(confidence),
        provenance(doc_id, tier),
    )
    .map(Fact::from)
    .unwrap_or_else(|e| panic!("fixture relationship: {}", e))
}

/// `n` distinct service entities.
pub fn service_facts(doc_id: Uuid, n: usize) -> Vec<Fact> {
    (0..n)
        .map(|i| entity_fact(doc_id, NodeKey::service(&format!("svc-{}", i)), Tier::A, 1.0))
        .collect()
}

/// A document with its text cut into one window per blank-line paragraph.
pub fn document(source_type: SourceType, text: &str) -> (Document, Vec<Window>) {
    let doc = Document::new(source_type, text);
    let mut windows = Vec::new();
    let mut offset = 0;
    for paragraph in text.split("\n\n") {
        if !paragraph.trim().is_empty() {
            windows.push(Window::new(doc.doc_id, paragraph, offset));
        }
        offset += paragraph.len() + 2;
    }
    (doc, windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_inference_scripts_by_fragment() {
        let mock = MockInference::new().with_reply("ledger", &[("Service", "ledger")], &[]);
        let doc = Uuid::new_v4();
        let request = InferenceRequest {
            items: vec![
                InferenceItem::from(&Window::new(doc, "the ledger sync", 0)),
                InferenceItem::from(&Window::new(doc, "nothing here", 20)),
            ],
            schema: serde_json::Value::Null,
            temperature: 0.0,
        };

        let replies = mock.infer_batch(&request).await.unwrap();
        assert!(replies[0].as_ref().unwrap().contains("ledger"));
        assert!(replies[1].as_ref().unwrap().contains("\"entities\":[]"));
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.items_sent(), 2);
    }

    #[tokio::test]
    async fn test_flaky_store_conflicts_then_commits() {
        let store = FlakyGraphStore::new();
        store.fail_next(1);
        let batch = GraphBatch::from_facts(&service_facts(Uuid::new_v4(), 2), chrono::Utc::now());

        assert!(matches!(store.merge_batch(&batch).await, Err(GraphError::Conflict(_))));
        assert_eq!(store.merge_batch(&batch).await.unwrap().nodes_created, 2);
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn test_document_windows_track_offsets() {
        let text = "first part\n\nsecond part";
        let (doc, windows) = document(SourceType::Text, text);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].span.start, 12);
        assert_eq!(&text[windows[1].span.start..windows[1].span.end], "second part");
        assert!(windows.iter().all(|w| w.doc_id == doc.doc_id));
    }
}
