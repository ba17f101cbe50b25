//! Cypher rendering of merge batches.
//!
//! Every statement text is a compile-time constant selected from a lookup
//! table indexed by [`NodeKind`] / [`RelKind`]. Labels and relationship types
//! are never interpolated from extracted text; only parameter rows vary.
//!
//! Nodes carry their kind label plus `:Entity` and a `uid` of the form
//! `Label:value`, which edge statements match on. Timestamps are fixed-width
//! UTC strings, so `updated_at` only ever moves forward by string comparison.

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{json, Value};

use crate::error::GraphResult;
use crate::traits::graph::{EdgeRow, GraphBatch, GraphStore, NodeRow};
use crate::types::fact::{NodeKey, NodeKind, RelKind};
use crate::types::write::MergeStats;

macro_rules! node_merge {
    ($label:literal, $key:literal) => {
        concat!(
            "UNWIND $rows AS row ",
            "MERGE (n:", $label, " {", $key, ": row.key}) ",
            "ON CREATE SET n:Entity, n.uid = row.uid, n.created_at = row.committed_at ",
            "SET n += row.properties, ",
            "n.updated_at = CASE WHEN coalesce(n.updated_at, '') < row.committed_at ",
            "THEN row.committed_at ELSE n.updated_at END, ",
            "n.sources = CASE WHEN row.source IN coalesce(n.sources, []) ",
            "THEN n.sources ELSE coalesce(n.sources, []) + row.source END"
        )
    };
}

macro_rules! node_ensure {
    ($label:literal, $key:literal) => {
        concat!(
            "UNWIND $rows AS row ",
            "MERGE (n:", $label, " {", $key, ": row.key}) ",
            "ON CREATE SET n:Entity, n.uid = row.uid, n.created_at = row.committed_at, ",
            "n.updated_at = row.committed_at"
        )
    };
}

macro_rules! edge_merge {
    ($rel:literal) => {
        concat!(
            "UNWIND $rows AS row ",
            "MATCH (a:Entity {uid: row.subject}) ",
            "MATCH (b:Entity {uid: row.object}) ",
            "MERGE (a)-[r:", $rel, "]->(b) ",
            "ON CREATE SET r.created_at = row.committed_at, r.since = coalesce(row.since, row.committed_at) ",
            "SET r += row.properties, ",
            "r.updated_at = CASE WHEN coalesce(r.updated_at, '') < row.committed_at ",
            "THEN row.committed_at ELSE r.updated_at END, ",
            "r.sources = CASE WHEN row.source IN coalesce(r.sources, []) ",
            "THEN r.sources ELSE coalesce(r.sources, []) + row.source END"
        )
    };
}

struct NodeStatements {
    merge: &'static str,
    ensure: &'static str,
}

macro_rules! node_statements {
    ($label:literal, $key:literal) => {
        NodeStatements {
            merge: node_merge!($label, $key),
            ensure: node_ensure!($label, $key),
        }
    };
}

// Indexed by NodeKind discriminant.
const NODE_STATEMENTS: [NodeStatements; 7] = [
    node_statements!("Service", "name"),
    node_statements!("Host", "hostname"),
    node_statements!("IP", "address"),
    node_statements!("Proxy", "name"),
    node_statements!("Endpoint", "url"),
    node_statements!("Port", "number"),
    node_statements!("Document", "docId"),
];

// Indexed by RelKind discriminant.
const REL_STATEMENTS: [&str; 9] = [
    edge_merge!("DEPENDS_ON"),
    edge_merge!("BINDS_PORT"),
    edge_merge!("RUNS_ON"),
    edge_merge!("RESOLVES_TO"),
    edge_merge!("ROUTES_TO"),
    edge_merge!("EXPOSES"),
    edge_merge!("CALLS"),
    edge_merge!("CONNECTS_TO"),
    edge_merge!("MENTIONED_IN"),
];

/// One parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CypherStatement {
    pub query: &'static str,
    pub rows: Vec<Value>,
}

/// Runs rendered statements against a Cypher-speaking database.
///
/// All statements of one call must commit in a single transaction. Lock
/// contention and deadlocks map to [`GraphError::Conflict`](crate::error::GraphError::Conflict).
#[async_trait]
pub trait CypherExecutor: Send + Sync {
    async fn run_transaction(&self, statements: &[CypherStatement]) -> GraphResult<MergeStats>;
}

/// Render a batch as statements: node merges, endpoint ensures, then edges.
pub fn render(batch: &GraphBatch) -> Vec<CypherStatement> {
    let committed_at = batch.committed_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut merges: Vec<Vec<Value>> = vec![Vec::new(); NodeKind::ALL.len()];
    let mut ensures: Vec<Vec<Value>> = vec![Vec::new(); NodeKind::ALL.len()];
    let mut edges: Vec<Vec<Value>> = vec![Vec::new(); RelKind::ALL.len()];

    for row in &batch.nodes {
        merges[row.key.kind as usize].push(node_row(row, &committed_at));
    }
    for row in &batch.edges {
        for endpoint in [&row.subject, &row.object] {
            ensures[endpoint.kind as usize].push(key_row(endpoint, &committed_at));
        }
        edges[row.kind as usize].push(edge_row(row, &committed_at));
    }

    let mut statements = Vec::new();
    for kind in NodeKind::ALL {
        let rows = std::mem::take(&mut merges[kind as usize]);
        if !rows.is_empty() {
            statements.push(CypherStatement {
                query: NODE_STATEMENTS[kind as usize].merge,
                rows,
            });
        }
    }
    for kind in NodeKind::ALL {
        let rows = std::mem::take(&mut ensures[kind as usize]);
        if !rows.is_empty() {
            statements.push(CypherStatement {
                query: NODE_STATEMENTS[kind as usize].ensure,
                rows,
            });
        }
    }
    for kind in RelKind::ALL {
        let rows = std::mem::take(&mut edges[kind as usize]);
        if !rows.is_empty() {
            statements.push(CypherStatement {
                query: REL_STATEMENTS[kind as usize],
                rows,
            });
        }
    }
    statements
}

fn key_row(key: &NodeKey, committed_at: &str) -> Value {
    json!({
        "key": key.value,
        "uid": key.to_string(),
        "committed_at": committed_at,
    })
}

fn node_row(row: &NodeRow, committed_at: &str) -> Value {
    json!({
        "key": row.key.value,
        "uid": row.key.to_string(),
        "properties": row.properties,
        "source": serde_json::to_string(&row.source).unwrap_or_default(),
        "committed_at": committed_at,
    })
}

fn edge_row(row: &EdgeRow, committed_at: &str) -> Value {
    json!({
        "subject": row.subject.to_string(),
        "object": row.object.to_string(),
        "properties": row.properties,
        "source": serde_json::to_string(&row.source).unwrap_or_default(),
        "since": row.since.map(|since| since.to_rfc3339()),
        "committed_at": committed_at,
    })
}

/// [`GraphStore`] that renders batches to Cypher and hands them to an executor.
pub struct CypherGraphStore<E> {
    executor: E,
}

impl<E: CypherExecutor> CypherGraphStore<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }
}

#[async_trait]
impl<E: CypherExecutor> GraphStore for CypherGraphStore<E> {
    async fn merge_batch(&self, batch: &GraphBatch) -> GraphResult<MergeStats> {
        let statements = render(batch);
        if statements.is_empty() {
            return Ok(MergeStats::default());
        }
        tracing::debug!(
            statements = statements.len(),
            rows = batch.len(),
            "running cypher merge transaction"
        );
        self.executor.run_transaction(&statements).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::document::Span;
    use crate::types::fact::{Confidence, ExtractedEntity, ExtractedRelationship, Fact, Provenance, Tier};
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingExecutor {
        transactions: Mutex<Vec<Vec<CypherStatement>>>,
    }

    #[async_trait]
    impl CypherExecutor for RecordingExecutor {
        async fn run_transaction(&self, statements: &[CypherStatement]) -> GraphResult<MergeStats> {
            self.transactions.lock().unwrap().push(statements.to_vec());
            Ok(MergeStats::default())
        }
    }

    fn provenance() -> Provenance {
        Provenance {
            doc_id: Uuid::nil(),
            window_id: Uuid::nil(),
            span: Span::new(0, 5),
            section: None,
            tier: Tier::A,
            extractor_version: "1.0.0".into(),
            method: "config:ports".into(),
        }
    }

    #[test]
    fn test_statement_tables_use_vocabulary_labels() {
        for kind in NodeKind::ALL {
            let statements = &NODE_STATEMENTS[kind as usize];
            let pattern = format!("(n:{} {{{}: row.key}})", kind.label(), kind.key_property());
            assert!(statements.merge.contains(&pattern), "{}", statements.merge);
            assert!(statements.ensure.contains(&pattern), "{}", statements.ensure);
        }
        for kind in RelKind::ALL {
            let pattern = format!("[r:{}]", kind.rel_type());
            assert!(REL_STATEMENTS[kind as usize].contains(&pattern));
        }
    }

    #[tokio::test]
    async fn test_render_groups_rows_by_kind() {
        let facts: Vec<Fact> = vec![
            ExtractedEntity::new(NodeKey::service("nginx"), Confidence::CERTAIN, provenance()).into(),
            ExtractedEntity::new(NodeKey::service("postgres"), Confidence::CERTAIN, provenance()).into(),
            ExtractedRelationship::new(
                RelKind::BindsPort,
                NodeKey::service("nginx"),
                NodeKey::port(80),
                Confidence::CERTAIN,
                provenance(),
            )
            .unwrap()
            .into(),
        ];
        let batch = GraphBatch::from_facts(&facts, Utc::now());
        let store = CypherGraphStore::new(RecordingExecutor::default());
        store.merge_batch(&batch).await.unwrap();

        let transactions = store.executor().transactions.lock().unwrap();
        assert_eq!(transactions.len(), 1);
        let statements = &transactions[0];

        // service merge, service ensure, port ensure, edge
        assert_eq!(statements.len(), 4);
        assert_eq!(statements[0].query, NODE_STATEMENTS[NodeKind::Service as usize].merge);
        assert_eq!(statements[0].rows.len(), 2);
        assert_eq!(statements[3].query, REL_STATEMENTS[RelKind::BindsPort as usize]);
        assert_eq!(statements[3].rows[0]["object"], "Port:80");
        assert_eq!(statements[3].rows[0]["properties"]["sourceTier"], "A");
    }

    #[test]
    fn test_committed_at_is_fixed_width_and_never_moves_back() {
        let facts: Vec<Fact> =
            vec![ExtractedEntity::new(NodeKey::service("nginx"), Confidence::CERTAIN, provenance()).into()];
        let on_the_second = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let later = on_the_second + chrono::Duration::milliseconds(250);

        let first = render(&GraphBatch::from_facts(&facts, on_the_second));
        let second = render(&GraphBatch::from_facts(&facts, later));
        let a = first[0].rows[0]["committed_at"].as_str().unwrap().to_string();
        let b = second[0].rows[0]["committed_at"].as_str().unwrap().to_string();
        assert_eq!(a, "2026-01-01T00:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);

        let merge = NODE_STATEMENTS[NodeKind::Service as usize].merge;
        assert!(merge.contains("coalesce(n.updated_at, '') < row.committed_at"));
    }

    #[test]
    fn test_hostile_names_stay_in_parameters() {
        let hostile = NodeKey::parse(NodeKind::Service, "x}) DETACH DELETE n //").unwrap();
        let facts: Vec<Fact> =
            vec![ExtractedEntity::new(hostile, Confidence::CERTAIN, provenance()).into()];
        let statements = render(&GraphBatch::from_facts(&facts, Utc::now()));
        assert!(!statements[0].query.contains("DETACH"));
        assert!(statements[0].rows[0]["key"].as_str().unwrap().contains("detach"));
    }
}
