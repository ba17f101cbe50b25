//! Typed errors for the extraction core.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can tell a
//! per-window failure (routed to the dead letter queue) apart from an
//! infrastructure failure (which aborts the current document or batch).

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::types::dlq::FailureKind;

/// Errors surfaced by the orchestrator and its components.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Cache/DLQ store failed outside of any document context
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Graph write failed hard
    #[error("graph write failed: {0}")]
    Write(#[from] WriteError),

    /// Infrastructure failure while processing a document.
    ///
    /// Carries enough context for an operator to act on.
    #[error(
        "infrastructure failure for document {doc_id} (window {window_id:?}, retry {retry_count:?}): {source}"
    )]
    Infrastructure {
        doc_id: Uuid,
        window_id: Option<Uuid>,
        retry_count: Option<u32>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Window does not belong to the document it was submitted with
    #[error("window {window_id} does not belong to document {doc_id}")]
    ForeignWindow { window_id: Uuid, doc_id: Uuid },

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ExtractionError {
    /// Wrap a lower-level error with document/window context.
    pub fn infrastructure(
        doc_id: Uuid,
        window_id: Option<Uuid>,
        retry_count: Option<u32>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Infrastructure {
            doc_id,
            window_id,
            retry_count,
            source: source.into(),
        }
    }
}

/// Errors from the shared key/TTL + sorted-set store backing the cache and DLQ.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Backend-specific failure
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A value was present but could not be decoded
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors returned by a graph store for a single merge operation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Lock contention or a deadlock with a concurrent writer
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Graph store cannot be reached
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the batch
    #[error("batch rejected: {0}")]
    Rejected(String),
}

impl GraphError {
    /// Whether retrying the same batch may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::Conflict(_))
    }
}

/// Hard failures of the batch graph writer.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Conflicts persisted through every retry and the shrunken retry
    #[error("write conflicts persisted after {attempts} attempts ({rows_committed} rows committed before failing)")]
    ConflictsPersisted {
        attempts: u32,
        rows_committed: usize,
    },

    /// A commit did not finish within the configured timeout
    #[error("graph commit timed out after {0:?}")]
    Timeout(Duration),

    /// Non-transient store failure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Writer refused facts for a cancelled document
    #[error("document {0} was cancelled; facts discarded")]
    Cancelled(Uuid),
}

/// Errors from the pluggable inference capability.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// Call did not complete in time
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    /// Network-level failure
    #[error("inference transport error: {0}")]
    Transport(String),

    /// Provider asked us to slow down
    #[error("inference rate limited")]
    RateLimited,

    /// Provider returned an error response
    #[error("inference provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    /// Request can never succeed (e.g. oversized input)
    #[error("inference request rejected: {0}")]
    Rejected(String),
}

impl InferenceError {
    /// Classify for the dead letter queue.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            InferenceError::Rejected(_) => FailureKind::NonRetryable,
            InferenceError::Provider { status, .. } if (400..500).contains(status) && *status != 429 => {
                FailureKind::NonRetryable
            }
            _ => FailureKind::Transient,
        }
    }
}

/// Validation failures for model output against the fixed schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Output was not valid JSON for the schema
    #[error("malformed output: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Unknown node type
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Unknown relationship type
    #[error("unknown relation type: {0}")]
    UnknownRelationType(String),

    /// Entity or endpoint name is empty
    #[error("empty name for {0}")]
    EmptyName(String),

    /// Entity name cannot be turned into a natural key
    #[error("invalid key for {kind}: {value}")]
    InvalidKey { kind: String, value: String },

    /// Relation refers to an entity missing from the response
    #[error("relation endpoint not declared as entity: {0}")]
    DanglingEndpoint(String),

    /// Relation kind does not connect these node kinds
    #[error("relation {relation} not allowed from {subject} to {object}")]
    DisallowedRelation {
        relation: String,
        subject: String,
        object: String,
    },

    /// Model-reported confidence outside [0, 1]
    #[error("confidence out of range: {0}")]
    ConfidenceOutOfRange(f64),

    /// Provenance block does not describe the submitted window
    #[error("provenance mismatch: {0}")]
    ProvenanceMismatch(String),
}

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractionError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for graph store operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Result type alias for writer operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;
