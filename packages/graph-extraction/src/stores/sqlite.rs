//! SQLite storage implementation.
//!
//! A file-based backend for both ports. Good for:
//! - Local development
//! - Single-server deployments
//! - Testing with persistent data
//!
//! Expiry is wall-clock based (milliseconds since the epoch in `expires_at`).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};

use crate::error::{GraphError, GraphResult, StoreError, StoreResult};
use crate::traits::graph::{accumulate_source, merge_properties, GraphBatch, GraphStore, SourceRecord};
use crate::traits::kv::KvStore;
use crate::types::fact::NodeKey;
use crate::types::write::MergeStats;

async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    // Every connection to `sqlite::memory:` opens a separate database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Set the `updated_at` property to the later of its stored value and `at`,
/// returning what was written.
fn touch(properties: &mut BTreeMap<String, Value>, at: DateTime<Utc>) -> String {
    let stored = properties
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|stored| stored.with_timezone(&Utc));
    let updated_at = stored.map_or(at, |stored| stored.max(at)).to_rfc3339();
    properties.insert("updated_at".to_string(), Value::from(updated_at.clone()));
    updated_at
}

fn store_err(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Backend(Box::new(other)),
    }
}

fn graph_err(e: sqlx::Error) -> GraphError {
    match &e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            if message.contains("locked") || message.contains("busy") {
                GraphError::Conflict(db.message().to_string())
            } else {
                GraphError::Rejected(db.message().to_string())
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            GraphError::Unavailable(e.to_string())
        }
        _ => GraphError::Rejected(e.to_string()),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// SQLite-backed key/TTL + sorted-set store.
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Create a new store with the given connection URL.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite://./extraction.db?mode=rwc` - Create if not exists
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = connect(database_url).await.map_err(store_err)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> StoreResult<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zset (
                set_name TEXT NOT NULL,
                member TEXT NOT NULL,
                score REAL NOT NULL,
                PRIMARY KEY (set_name, member)
            );

            CREATE INDEX IF NOT EXISTS idx_zset_score ON zset(set_name, score);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?, ?, NULL)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = NULL
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)")
            .bind(key)
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        sqlx::query("DELETE FROM kv WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        let current: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;

        let next = match current {
            Some(value) => {
                value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })? + 1
            }
            None => 1,
        };

        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?, ?, NULL)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(next.to_string())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE kv SET expires_at = ? WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(expiry_ms(ttl))
        .bind(key)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> StoreResult<Vec<String>> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT key FROM kv
            WHERE key LIKE ? ESCAPE '\' AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            LIMIT ?
            "#,
        )
        .bind(format!("{}%", escaped))
        .bind(now_ms())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO zset (set_name, member, score) VALUES (?, ?, ?)
            ON CONFLICT(set_name, member) DO UPDATE SET score = excluded.score
            "#,
        )
        .bind(set)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM zset WHERE set_name = ? AND member = ?")
            .bind(set)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        sqlx::query_as::<_, (String, f64)>(
            r#"
            SELECT member, score FROM zset
            WHERE set_name = ? AND score >= ? AND score <= ?
            ORDER BY score, member
            LIMIT ?
            "#,
        )
        .bind(set)
        .bind(min)
        .bind(max)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)
    }

    async fn zcard(&self, set: &str) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM zset WHERE set_name = ?")
            .bind(set)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[derive(Debug, FromRow)]
struct StoredRow {
    properties: String,
    sources: String,
}

impl StoredRow {
    fn decode(&self) -> GraphResult<(BTreeMap<String, Value>, Vec<SourceRecord>)> {
        let properties = serde_json::from_str(&self.properties)
            .map_err(|e| GraphError::Rejected(format!("corrupt stored properties: {}", e)))?;
        let sources = serde_json::from_str(&self.sources)
            .map_err(|e| GraphError::Rejected(format!("corrupt stored sources: {}", e)))?;
        Ok((properties, sources))
    }
}

fn encode<T: serde::Serialize>(value: &T) -> GraphResult<String> {
    serde_json::to_string(value).map_err(|e| GraphError::Rejected(e.to_string()))
}

/// SQLite-backed property graph applying batches with upsert semantics.
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    /// Create a new graph store with the given connection URL.
    pub async fn new(database_url: &str) -> GraphResult<Self> {
        let pool = connect(database_url).await.map_err(graph_err)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory graph store (for testing).
    pub async fn in_memory() -> GraphResult<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> GraphResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                uid TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                key TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                sources TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_label ON nodes(label);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(graph_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS edges (
                rel_type TEXT NOT NULL,
                subject TEXT NOT NULL,
                object TEXT NOT NULL,
                properties TEXT NOT NULL DEFAULT '{}',
                sources TEXT NOT NULL DEFAULT '[]',
                since TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (rel_type, subject, object)
            );

            CREATE INDEX IF NOT EXISTS idx_edges_subject ON edges(subject);
            CREATE INDEX IF NOT EXISTS idx_edges_object ON edges(object);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(graph_err)?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn node_count(&self) -> GraphResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await
            .map_err(graph_err)
    }

    pub async fn edge_count(&self) -> GraphResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await
            .map_err(graph_err)
    }

    async fn merge_node(
        tx: &mut Transaction<'_, Sqlite>,
        key: &NodeKey,
        incoming: Option<(&BTreeMap<String, Value>, &SourceRecord)>,
        at: DateTime<Utc>,
    ) -> GraphResult<bool> {
        let uid = key.to_string();
        let existing = sqlx::query_as::<_, StoredRow>("SELECT properties, sources FROM nodes WHERE uid = ?")
            .bind(&uid)
            .fetch_optional(&mut **tx)
            .await
            .map_err(graph_err)?;

        let created = existing.is_none();
        if !created && incoming.is_none() {
            return Ok(false);
        }

        let (mut properties, mut sources) = match &existing {
            Some(row) => row.decode()?,
            None => {
                let mut properties = BTreeMap::new();
                properties.insert(key.kind.key_property().to_string(), Value::from(key.value.clone()));
                properties.insert("created_at".to_string(), Value::from(at.to_rfc3339()));
                (properties, Vec::new())
            }
        };
        if let Some((incoming, source)) = incoming {
            merge_properties(&mut properties, incoming);
            accumulate_source(&mut sources, source);
        }
        let updated_at = touch(&mut properties, at);

        sqlx::query(
            r#"
            INSERT INTO nodes (uid, label, key, properties, sources, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uid) DO UPDATE SET
                properties = excluded.properties,
                sources = excluded.sources,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&uid)
        .bind(key.kind.label())
        .bind(&key.value)
        .bind(encode(&properties)?)
        .bind(encode(&sources)?)
        .bind(at.to_rfc3339())
        .bind(updated_at)
        .execute(&mut **tx)
        .await
        .map_err(graph_err)?;

        Ok(created)
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn merge_batch(&self, batch: &GraphBatch) -> GraphResult<MergeStats> {
        let at = batch.committed_at;
        let mut stats = MergeStats::default();
        let mut tx = self.pool.begin().await.map_err(graph_err)?;

        for row in &batch.nodes {
            if Self::merge_node(&mut tx, &row.key, Some((&row.properties, &row.source)), at).await? {
                stats.nodes_created += 1;
            } else {
                stats.nodes_matched += 1;
            }
        }

        for row in &batch.edges {
            for endpoint in [&row.subject, &row.object] {
                if Self::merge_node(&mut tx, endpoint, None, at).await? {
                    stats.nodes_created += 1;
                }
            }

            let subject = row.subject.to_string();
            let object = row.object.to_string();
            let existing = sqlx::query_as::<_, StoredRow>(
                "SELECT properties, sources FROM edges WHERE rel_type = ? AND subject = ? AND object = ?",
            )
            .bind(row.kind.rel_type())
            .bind(&subject)
            .bind(&object)
            .fetch_optional(&mut *tx)
            .await
            .map_err(graph_err)?;

            let since = row.since.unwrap_or(at);
            let (mut properties, mut sources) = match &existing {
                Some(stored) => {
                    stats.edges_matched += 1;
                    stored.decode()?
                }
                None => {
                    stats.edges_created += 1;
                    let mut properties = BTreeMap::new();
                    properties.insert("created_at".to_string(), Value::from(at.to_rfc3339()));
                    properties.insert("since".to_string(), Value::from(since.to_rfc3339()));
                    (properties, Vec::new())
                }
            };
            merge_properties(&mut properties, &row.properties);
            let updated_at = touch(&mut properties, at);
            accumulate_source(&mut sources, &row.source);

            sqlx::query(
                r#"
                INSERT INTO edges (rel_type, subject, object, properties, sources, since, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(rel_type, subject, object) DO UPDATE SET
                    properties = excluded.properties,
                    sources = excluded.sources,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(row.kind.rel_type())
            .bind(&subject)
            .bind(&object)
            .bind(encode(&properties)?)
            .bind(encode(&sources)?)
            .bind(since.to_rfc3339())
            .bind(at.to_rfc3339())
            .bind(updated_at)
            .execute(&mut *tx)
            .await
            .map_err(graph_err)?;
        }

        tx.commit().await.map_err(graph_err)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::document::Span;
    use crate::types::fact::{Confidence, ExtractedRelationship, Fact, Provenance, RelKind, Tier};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_sqlite_kv_round_trip() {
        let store = SqliteKvStore::in_memory().await.unwrap();
        store.set_ex("extraction:abc", "{}", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("extraction:abc").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(store.incr("dlq:retry:abc").await.unwrap(), 1);
        assert_eq!(store.incr("dlq:retry:abc").await.unwrap(), 2);
        assert_eq!(store.scan_prefix("extraction:", 10).await.unwrap(), vec!["extraction:abc"]);

        store.zadd("dlq:pending", "abc", 10.0).await.unwrap();
        assert_eq!(store.zcard("dlq:pending").await.unwrap(), 1);
        assert!(store.zrem("dlq:pending", "abc").await.unwrap());
        assert!(!store.zrem("dlq:pending", "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_graph_merge_is_idempotent() {
        let graph = SqliteGraphStore::in_memory().await.unwrap();
        let provenance = Provenance {
            doc_id: Uuid::nil(),
            window_id: Uuid::nil(),
            span: Span::new(0, 10),
            section: None,
            tier: Tier::A,
            extractor_version: "1.0.0".into(),
            method: "config:depends_on".into(),
        };
        let facts: Vec<Fact> = vec![ExtractedRelationship::new(
            RelKind::DependsOn,
            NodeKey::service("nginx"),
            NodeKey::service("postgres"),
            Confidence::CERTAIN,
            provenance,
        )
        .unwrap()
        .into()];

        let first = graph.merge_batch(&GraphBatch::from_facts(&facts, Utc::now())).await.unwrap();
        assert_eq!(first.nodes_created, 2);
        assert_eq!(first.edges_created, 1);

        let second = graph.merge_batch(&GraphBatch::from_facts(&facts, Utc::now())).await.unwrap();
        assert_eq!(second.nodes_created + second.edges_created, 0);
        assert_eq!(graph.node_count().await.unwrap(), 2);
        assert_eq!(graph.edge_count().await.unwrap(), 1);

        let late = Utc::now() - chrono::Duration::seconds(5);
        graph.merge_batch(&GraphBatch::from_facts(&facts, late)).await.unwrap();
        let (created_at, updated_at): (String, String) =
            sqlx::query_as("SELECT created_at, updated_at FROM edges")
                .fetch_one(graph.pool())
                .await
                .unwrap();
        let created_at = DateTime::parse_from_rfc3339(&created_at).unwrap();
        let updated_at = DateTime::parse_from_rfc3339(&updated_at).unwrap();
        assert!(updated_at >= created_at);
        assert!(updated_at > late);
    }
}
