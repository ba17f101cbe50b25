//! Incremental re-extraction support.
//!
//! After a document is processed its fact set is stored as a snapshot. When
//! the document changes, the new fact set is compared against the snapshot so
//! only new or re-scored facts are committed. Facts that disappeared are
//! reported; deleting them from the graph is left to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::pipeline::cache::encode;
use crate::traits::kv::KvStore;
use crate::types::fact::{Confidence, Fact, FactKey, FactSet};

const SNAPSHOT_PREFIX: &str = "extraction:facts:";
const PROCESSED_SET: &str = "extraction:processed";

/// Confidence differences smaller than this are not reported.
const CONFIDENCE_EPSILON: f64 = 1e-9;

/// A fact whose confidence moved between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceChange {
    pub fact: Fact,
    pub previous: Confidence,
}

/// Difference between two fact sets of the same document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactDiff {
    pub added: Vec<Fact>,
    pub removed: Vec<FactKey>,
    pub confidence_changed: Vec<ConfidenceChange>,
}

impl FactDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.confidence_changed.is_empty()
    }

    /// Facts that need a graph write: additions and re-scored facts.
    pub fn to_commit(&self) -> Vec<Fact> {
        self.added
            .iter()
            .cloned()
            .chain(self.confidence_changed.iter().map(|c| c.fact.clone()))
            .collect()
    }
}

/// Compare a previous fact set with a fresh one.
pub fn diff(previous: &FactSet, current: &FactSet) -> FactDiff {
    let mut result = FactDiff::default();

    for fact in current.facts() {
        match previous.get(&fact.key()) {
            None => result.added.push(fact.clone()),
            Some(old) => {
                if (old.confidence().value() - fact.confidence().value()).abs() > CONFIDENCE_EPSILON {
                    result.confidence_changed.push(ConfidenceChange {
                        fact: fact.clone(),
                        previous: old.confidence(),
                    });
                }
            }
        }
    }

    result.removed = previous
        .facts()
        .map(Fact::key)
        .filter(|key| !current.contains(key))
        .collect();
    result
}

/// Stored fact set of a processed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSnapshot {
    pub doc_id: Uuid,
    pub extractor_version: String,
    pub processed_at: DateTime<Utc>,
    pub facts: Vec<Fact>,
}

impl FactSnapshot {
    pub fn from_set(set: &FactSet, processed_at: DateTime<Utc>) -> Self {
        Self {
            doc_id: set.doc_id,
            extractor_version: set.extractor_version.clone(),
            processed_at,
            facts: set.facts().cloned().collect(),
        }
    }

    pub fn into_set(self) -> FactSet {
        FactSet::from_facts(self.doc_id, self.extractor_version, self.facts)
    }
}

/// Per-document snapshots kept in the shared store, without expiry.
pub struct FactSnapshotStore<K> {
    store: K,
}

impl<K: KvStore> FactSnapshotStore<K> {
    pub fn new(store: K) -> Self {
        Self { store }
    }

    pub async fn load(&self, doc_id: Uuid) -> StoreResult<Option<FactSnapshot>> {
        let key = format!("{}{}", SNAPSHOT_PREFIX, doc_id);
        match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn save(&self, snapshot: &FactSnapshot) -> StoreResult<()> {
        let key = format!("{}{}", SNAPSHOT_PREFIX, snapshot.doc_id);
        self.store.set(&key, &encode(&key, snapshot)?).await?;
        self.store
            .zadd(
                PROCESSED_SET,
                &snapshot.doc_id.to_string(),
                snapshot.processed_at.timestamp_millis() as f64,
            )
            .await
    }

    /// Documents whose latest snapshot was taken at or after `since`.
    pub async fn processed_since(&self, since: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Uuid>> {
        let members = self
            .store
            .zrange_by_score(PROCESSED_SET, since.timestamp_millis() as f64, f64::INFINITY, limit)
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|(member, _)| member.parse().ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryKvStore;
    use crate::testing::{entity_fact, relationship_fact};
    use crate::types::fact::{NodeKey, RelKind, Tier};
    use chrono::Duration;

    #[test]
    fn test_diff_reports_changes() {
        let doc = Uuid::new_v4();
        let previous = FactSet::from_facts(
            doc,
            "1.0.0",
            vec![
                entity_fact(doc, NodeKey::service("api"), Tier::A, 1.0),
                entity_fact(doc, NodeKey::service("cache"), Tier::B, 0.6),
                entity_fact(doc, NodeKey::service("legacy"), Tier::A, 1.0),
            ],
        );
        let current = FactSet::from_facts(
            doc,
            "1.0.0",
            vec![
                entity_fact(doc, NodeKey::service("api"), Tier::A, 1.0),
                entity_fact(doc, NodeKey::service("cache"), Tier::B, 0.8),
                relationship_fact(doc, RelKind::DependsOn, "api", "cache", Tier::A, 1.0),
            ],
        );

        let diff = diff(&previous, &current);
        assert_eq!(diff.added.len(), 1);
        assert!(diff.added[0].is_relationship());
        assert_eq!(diff.removed, vec![FactKey::Node(NodeKey::service("legacy"))]);
        assert_eq!(diff.confidence_changed.len(), 1);
        assert_eq!(diff.confidence_changed[0].previous.value(), 0.6);
        assert_eq!(diff.to_commit().len(), 2);
    }

    #[test]
    fn test_unchanged_document_has_empty_diff() {
        let doc = Uuid::new_v4();
        let facts = vec![entity_fact(doc, NodeKey::service("api"), Tier::A, 1.0)];
        let a = FactSet::from_facts(doc, "1.0.0", facts.clone());
        let b = FactSet::from_facts(doc, "1.0.0", facts);
        assert!(diff(&a, &b).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_and_processed_since() {
        let store = FactSnapshotStore::new(MemoryKvStore::new());
        let doc = Uuid::new_v4();
        let set = FactSet::from_facts(doc, "1.0.0", vec![entity_fact(doc, NodeKey::service("api"), Tier::A, 1.0)]);
        let at = Utc::now();

        assert!(store.load(doc).await.unwrap().is_none());
        store.save(&FactSnapshot::from_set(&set, at)).await.unwrap();

        let loaded = store.load(doc).await.unwrap().unwrap().into_set();
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.processed_since(at - Duration::minutes(1), 10).await.unwrap(), vec![doc]);
        assert!(store.processed_since(at + Duration::minutes(1), 10).await.unwrap().is_empty());
    }
}
