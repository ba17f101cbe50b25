//! In-memory storage implementations for testing and development.
//!
//! Not suitable for production: data is lost on restart and nothing is shared
//! across processes. Expiry uses `tokio::time::Instant`, so tests can drive
//! TTLs with `tokio::time::pause` / `advance`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{GraphResult, StoreError, StoreResult};
use crate::traits::graph::{accumulate_source, merge_properties, GraphBatch, GraphStore, SourceRecord};
use crate::traits::kv::KvStore;
use crate::types::fact::{NodeKey, RelKind};
use crate::types::write::MergeStats;

struct KvValue {
    value: String,
    expires_at: Option<Instant>,
}

impl KvValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory key/TTL + sorted-set store.
pub struct MemoryKvStore {
    values: RwLock<HashMap<String, KvValue>>,
    sets: RwLock<HashMap<String, HashMap<String, f64>>>,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live keys (sorted sets excluded).
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }

    /// Remaining time to live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let entry = values.get(key).filter(|v| v.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        self.values.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.sets.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn write_value(&self, key: &str, value: &str, expires_at: Option<Instant>) {
        self.values.write().unwrap_or_else(PoisonError::into_inner).insert(
            key.to_string(),
            KvValue {
                value: value.to_string(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write_value(key, value, None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.write_value(key, value, Some(Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let removed = self
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(removed.is_some_and(|v| v.is_live(now)))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);

        let (current, expires_at) = match values.get(key).filter(|v| v.is_live(now)) {
            Some(existing) => {
                let parsed = existing.value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                (parsed, existing.expires_at)
            }
            None => (0, None),
        };

        let next = current + 1;
        values.insert(
            key.to_string(),
            KvValue {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        match values.get_mut(key).filter(|v| v.is_live(now)) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = values
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()> {
        self.sets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        Ok(sets
            .get_mut(set)
            .and_then(|members| members.remove(member))
            .is_some())
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = sets.get(set) else {
            return Ok(Vec::new());
        };

        let mut matching: Vec<(String, f64)> = members
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        matching.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn zcard(&self, set: &str) -> StoreResult<usize> {
        Ok(self
            .sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(set)
            .map_or(0, HashMap::len))
    }
}

/// A node as held by [`MemoryGraphStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub key: NodeKey,
    pub properties: BTreeMap<String, Value>,
    pub sources: Vec<SourceRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An edge as held by [`MemoryGraphStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEdge {
    pub kind: RelKind,
    pub subject: NodeKey,
    pub object: NodeKey,
    pub properties: BTreeMap<String, Value>,
    pub sources: Vec<SourceRecord>,
    pub since: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type EdgeId = (RelKind, NodeKey, NodeKey);

#[derive(Default)]
struct GraphState {
    nodes: HashMap<NodeKey, StoredNode>,
    edges: HashMap<EdgeId, StoredEdge>,
}

impl GraphState {
    /// Match-or-create a node. Returns whether it was created.
    fn merge_node(
        &mut self,
        key: &NodeKey,
        properties: Option<&BTreeMap<String, Value>>,
        source: Option<&SourceRecord>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut created = false;
        let node = self.nodes.entry(key.clone()).or_insert_with(|| {
            created = true;
            let mut properties = BTreeMap::new();
            properties.insert(key.kind.key_property().to_string(), Value::from(key.value.clone()));
            properties.insert("created_at".to_string(), Value::from(at.to_rfc3339()));
            StoredNode {
                key: key.clone(),
                properties,
                sources: Vec::new(),
                created_at: at,
                updated_at: at,
            }
        });

        if let Some(properties) = properties {
            merge_properties(&mut node.properties, properties);
            touch(&mut node.properties, &mut node.updated_at, at);
        }
        if let Some(source) = source {
            accumulate_source(&mut node.sources, source);
        }
        created
    }
}

/// Advance `updated_at` to `at`. A batch stamped earlier than the last write
/// (commits from workers with skewed clocks) never moves it back, so it also
/// stays at or after `created_at`.
fn touch(properties: &mut BTreeMap<String, Value>, updated_at: &mut DateTime<Utc>, at: DateTime<Utc>) {
    *updated_at = (*updated_at).max(at);
    properties.insert("updated_at".to_string(), Value::from(updated_at.to_rfc3339()));
}

/// In-memory property graph applying batches with MERGE semantics.
pub struct MemoryGraphStore {
    state: RwLock<GraphState>,
    commits: AtomicUsize,
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraphStore {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            commits: AtomicUsize::new(0),
        }
    }

    /// Get the number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).nodes.len()
    }

    /// Get the number of stored edges.
    pub fn edge_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).edges.len()
    }

    /// Number of successfully applied batches.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn node(&self, key: &NodeKey) -> Option<StoredNode> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .get(key)
            .cloned()
    }

    pub fn edge(&self, kind: RelKind, subject: &NodeKey, object: &NodeKey) -> Option<StoredEdge> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .edges
            .get(&(kind, subject.clone(), object.clone()))
            .cloned()
    }

    /// All edges, sorted by identity.
    pub fn edges(&self) -> Vec<StoredEdge> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut edges: Vec<StoredEdge> = state.edges.values().cloned().collect();
        edges.sort_by(|a, b| {
            (a.kind, &a.subject, &a.object).cmp(&(b.kind, &b.subject, &b.object))
        });
        edges
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn merge_batch(&self, batch: &GraphBatch) -> GraphResult<MergeStats> {
        let at = batch.committed_at;
        let mut stats = MergeStats::default();

        // One write lock for the whole batch keeps it atomic.
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        for row in &batch.nodes {
            if state.merge_node(&row.key, Some(&row.properties), Some(&row.source), at) {
                stats.nodes_created += 1;
            } else {
                stats.nodes_matched += 1;
            }
        }

        for row in &batch.edges {
            for endpoint in [&row.subject, &row.object] {
                if state.merge_node(endpoint, None, None, at) {
                    stats.nodes_created += 1;
                }
            }

            let id = (row.kind, row.subject.clone(), row.object.clone());
            let mut created = false;
            let edge = state.edges.entry(id).or_insert_with(|| {
                created = true;
                let since = row.since.unwrap_or(at);
                let mut properties = BTreeMap::new();
                properties.insert("created_at".to_string(), Value::from(at.to_rfc3339()));
                properties.insert("since".to_string(), Value::from(since.to_rfc3339()));
                StoredEdge {
                    kind: row.kind,
                    subject: row.subject.clone(),
                    object: row.object.clone(),
                    properties,
                    sources: Vec::new(),
                    since,
                    created_at: at,
                    updated_at: at,
                }
            });

            merge_properties(&mut edge.properties, &row.properties);
            touch(&mut edge.properties, &mut edge.updated_at, at);
            accumulate_source(&mut edge.sources, &row.source);

            if created {
                stats.edges_created += 1;
            } else {
                stats.edges_matched += 1;
            }
        }

        drop(state);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::document::Span;
    use crate::types::fact::{Confidence, ExtractedEntity, ExtractedRelationship, Fact, Provenance, Tier};
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_kv_expiry() {
        let store = MemoryKvStore::new();
        store.set_ex("a", "1", Duration::from_secs(10)).await.unwrap();
        store.set("b", "2").await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_kv_incr_and_del() {
        let store = MemoryKvStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert!(store.del("n").await.unwrap());
        assert!(!store.del("n").await.unwrap());
        assert_eq!(store.incr("n").await.unwrap(), 1);

        store.set("bad", "x").await.unwrap();
        assert!(matches!(store.incr("bad").await, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_claim() {
        let store = MemoryKvStore::new();
        store.zadd("z", "late", 300.0).await.unwrap();
        store.zadd("z", "early", 100.0).await.unwrap();
        store.zadd("z", "mid", 200.0).await.unwrap();

        let due = store.zrange_by_score("z", f64::NEG_INFINITY, 250.0, 10).await.unwrap();
        let names: Vec<_> = due.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, vec!["early", "mid"]);

        assert!(store.zrem("z", "early").await.unwrap());
        assert!(!store.zrem("z", "early").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scan_prefix_sorted_and_limited() {
        let store = MemoryKvStore::new();
        for key in ["p:c", "p:a", "p:b", "q:a"] {
            store.set(key, "v").await.unwrap();
        }
        assert_eq!(store.scan_prefix("p:", 2).await.unwrap(), vec!["p:a", "p:b"]);
    }

    fn provenance(doc_id: Uuid) -> Provenance {
        Provenance {
            doc_id,
            window_id: Uuid::nil(),
            span: Span::new(0, 10),
            section: None,
            tier: Tier::A,
            extractor_version: "1.0.0".into(),
            method: "config:depends_on".into(),
        }
    }

    fn facts(doc_id: Uuid) -> Vec<Fact> {
        vec![
            ExtractedEntity::new(NodeKey::service("nginx"), Confidence::CERTAIN, provenance(doc_id)).into(),
            ExtractedRelationship::new(
                RelKind::DependsOn,
                NodeKey::service("nginx"),
                NodeKey::service("postgres"),
                Confidence::CERTAIN,
                provenance(doc_id),
            )
            .unwrap()
            .into(),
        ]
    }

    #[tokio::test]
    async fn test_graph_merge_is_idempotent() {
        let graph = MemoryGraphStore::new();
        let doc_id = Uuid::new_v4();

        let first = graph
            .merge_batch(&GraphBatch::from_facts(&facts(doc_id), Utc::now()))
            .await
            .unwrap();
        assert_eq!(first.nodes_created, 2);
        assert_eq!(first.edges_created, 1);

        let second = graph
            .merge_batch(&GraphBatch::from_facts(&facts(doc_id), Utc::now()))
            .await
            .unwrap();
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.edges_created, 0);
        assert_eq!(second.edges_matched, 1);

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_graph_preserves_created_at_and_accumulates_provenance() {
        let graph = MemoryGraphStore::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(60);

        graph
            .merge_batch(&GraphBatch::from_facts(&facts(Uuid::new_v4()), t0))
            .await
            .unwrap();
        graph
            .merge_batch(&GraphBatch::from_facts(&facts(Uuid::new_v4()), t1))
            .await
            .unwrap();

        let edge = graph
            .edge(RelKind::DependsOn, &NodeKey::service("nginx"), &NodeKey::service("postgres"))
            .unwrap();
        assert_eq!(edge.created_at, t0);
        assert_eq!(edge.since, t0);
        assert_eq!(edge.updated_at, t1);
        assert!(edge.updated_at >= edge.created_at);
        assert_eq!(edge.sources.len(), 2);

        let node = graph.node(&NodeKey::service("nginx")).unwrap();
        assert_eq!(node.created_at, t0);
        assert_eq!(node.properties["name"], "nginx");
        assert_eq!(node.properties["created_at"], t0.to_rfc3339());
    }

    #[tokio::test]
    async fn test_late_batch_never_moves_updated_at_back() {
        let graph = MemoryGraphStore::new();
        let t1 = Utc::now();
        let earlier = t1 - chrono::Duration::seconds(5);

        graph
            .merge_batch(&GraphBatch::from_facts(&facts(Uuid::new_v4()), t1))
            .await
            .unwrap();
        graph
            .merge_batch(&GraphBatch::from_facts(&facts(Uuid::new_v4()), earlier))
            .await
            .unwrap();

        let node = graph.node(&NodeKey::service("nginx")).unwrap();
        assert_eq!(node.created_at, t1);
        assert_eq!(node.updated_at, t1);
        assert_eq!(node.properties["updated_at"], t1.to_rfc3339());

        let edge = graph
            .edge(RelKind::DependsOn, &NodeKey::service("nginx"), &NodeKey::service("postgres"))
            .unwrap();
        assert!(edge.updated_at >= edge.created_at);
        assert_eq!(edge.updated_at, t1);
        assert_eq!(edge.sources.len(), 2);
    }
}
