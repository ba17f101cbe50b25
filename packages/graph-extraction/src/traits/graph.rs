//! Graph store port and the row format of a merge batch.
//!
//! A batch is applied with match-or-create-then-set semantics: nodes merge by
//! natural key, edges by `(kind, subject key, object key)`. Incoming properties
//! overwrite stored ones, `created_at` (and an edge's `since`) are kept from
//! the first write, and provenance records accumulate without duplicates.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::GraphResult;
use crate::types::document::Span;
use crate::types::fact::{Fact, NodeKey, Provenance, RelKind, Tier};
use crate::types::write::MergeStats;

/// Provenance entry accumulated on stored nodes and edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRecord {
    pub doc_id: Uuid,
    pub span: Span,
    pub tier: Tier,
    pub extractor_version: String,
    pub method: String,
}

impl From<&Provenance> for SourceRecord {
    fn from(provenance: &Provenance) -> Self {
        Self {
            doc_id: provenance.doc_id,
            span: provenance.span,
            tier: provenance.tier,
            extractor_version: provenance.extractor_version.clone(),
            method: provenance.method.clone(),
        }
    }
}

/// One node row of a merge batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub key: NodeKey,
    pub properties: BTreeMap<String, Value>,
    pub source: SourceRecord,
}

/// One edge row of a merge batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub kind: RelKind,
    pub subject: NodeKey,
    pub object: NodeKey,
    pub properties: BTreeMap<String, Value>,
    pub source: SourceRecord,
    pub since: Option<DateTime<Utc>>,
}

/// Rows committed together in one graph operation.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphBatch {
    pub nodes: Vec<NodeRow>,
    pub edges: Vec<EdgeRow>,

    /// Timestamp written to `created_at` / `updated_at`
    pub committed_at: DateTime<Utc>,
}

impl GraphBatch {
    /// Turn facts into rows, adding the standard provenance properties.
    pub fn from_facts(facts: &[Fact], committed_at: DateTime<Utc>) -> Self {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        for fact in facts {
            match fact {
                Fact::Entity(entity) => {
                    let mut properties = entity.properties.clone();
                    insert_provenance_properties(
                        &mut properties,
                        &entity.provenance,
                        entity.confidence.value(),
                    );
                    nodes.push(NodeRow {
                        key: entity.key.clone(),
                        properties,
                        source: SourceRecord::from(&entity.provenance),
                    });
                }
                Fact::Relationship(rel) => {
                    let mut properties = rel.properties.clone();
                    insert_provenance_properties(&mut properties, &rel.provenance, rel.confidence.value());
                    edges.push(EdgeRow {
                        kind: rel.kind,
                        subject: rel.subject.clone(),
                        object: rel.object.clone(),
                        properties,
                        source: SourceRecord::from(&rel.provenance),
                        since: rel.since,
                    });
                }
            }
        }

        Self {
            nodes,
            edges,
            committed_at,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

fn insert_provenance_properties(
    properties: &mut BTreeMap<String, Value>,
    provenance: &Provenance,
    confidence: f64,
) {
    properties.insert("docId".into(), Value::from(provenance.doc_id.to_string()));
    properties.insert("confidence".into(), Value::from(confidence));
    properties.insert("sourceTier".into(), Value::from(provenance.tier.as_str()));
    properties.insert("extractionMethod".into(), Value::from(provenance.method.clone()));
    properties.insert(
        "extractorVersion".into(),
        Value::from(provenance.extractor_version.clone()),
    );
}

/// Properties a merge never overwrites once set.
pub const PRESERVED_PROPERTIES: &[&str] = &["created_at", "since"];

/// Apply incoming properties last-write-wins, skipping preserved ones.
pub fn merge_properties(stored: &mut BTreeMap<String, Value>, incoming: &BTreeMap<String, Value>) {
    for (name, value) in incoming {
        if PRESERVED_PROPERTIES.contains(&name.as_str()) && stored.contains_key(name) {
            continue;
        }
        stored.insert(name.clone(), value.clone());
    }
}

/// Append a source record unless it is already present.
pub fn accumulate_source(sources: &mut Vec<SourceRecord>, source: &SourceRecord) -> bool {
    if sources.contains(source) {
        return false;
    }
    sources.push(source.clone());
    true
}

/// Graph store accepting idempotent merge batches.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Apply one batch atomically.
    ///
    /// Edge endpoints that do not exist yet are created by key.
    async fn merge_batch(&self, batch: &GraphBatch) -> GraphResult<MergeStats>;
}

#[async_trait]
impl<T: GraphStore + ?Sized> GraphStore for Arc<T> {
    async fn merge_batch(&self, batch: &GraphBatch) -> GraphResult<MergeStats> {
        (**self).merge_batch(batch).await
    }
}
