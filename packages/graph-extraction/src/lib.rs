//! Tiered Document-to-Graph Extraction Library
//!
//! Turns configuration files and prose documents into nodes and relationships
//! of an infrastructure knowledge graph (services, hosts, IPs, proxies,
//! endpoints, ports) with provenance and confidence on every fact.
//!
//! # Design Philosophy
//!
//! **"Cheapest tier that can answer"**
//!
//! - Tier A parses structured content and matches patterns (confidence 1.0)
//! - Tier B handles prose with a syntactic extractor
//! - Tier C asks a model, constrained by a fixed schema and cached by content
//! - Failed windows are dead-lettered and retried with backoff
//! - Graph writes are idempotent, batched merges
//!
//! # Usage
//!
//! ```rust,ignore
//! use graph_extraction::{ExtractionPipeline, PipelineConfig, MemoryKvStore, MemoryGraphStore};
//! use graph_extraction::ai::LexiconNlp;
//! use graph_extraction::testing::{document, MockInference};
//!
//! let pipeline = ExtractionPipeline::new(
//!     PipelineConfig::default(),
//!     MemoryKvStore::new(),
//!     MockInference::new(),
//!     LexiconNlp::new()?,
//!     MemoryGraphStore::new(),
//! )?;
//!
//! let (doc, windows) = document(SourceType::Text, "The api depends on redis.");
//! let facts = pipeline.ingest_document(&doc, &windows, &CancellationToken::new()).await?;
//! pipeline.flush().await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Ports (KvStore, GraphStore, InferenceClient, SyntacticExtractor)
//! - [`types`] - Documents, facts, DLQ entries and configuration
//! - [`pipeline`] - Tiers, cache, dead letter queue, writer and orchestrator
//! - [`stores`] - Storage implementations (memory, Cypher, SQLite)
//! - [`ai`] - Reference syntactic and inference implementations
//! - [`testing`] - Mock implementations and fixtures for testing

pub mod ai;
pub mod error;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use error::{
    ExtractionError, GraphError, InferenceError, Result, SchemaError, StoreError, WriteError,
};
pub use traits::{
    graph::{GraphBatch, GraphStore},
    inference::{InferenceClient, InferenceItem, InferenceReply, InferenceRequest},
    kv::KvStore,
    syntactic::SyntacticExtractor,
};
pub use types::{
    config::{
        CacheConfig, DeterministicConfig, DlqConfig, EscalationConfig, InferenceConfig,
        PipelineConfig, WriterConfig,
    },
    dlq::{DlqEntry, DlqState, FailureKind},
    document::{Document, SourceType, Span, Window},
    fact::{Confidence, Fact, FactKey, FactSet, NodeKey, NodeKind, Provenance, RelKind, Tier},
    write::{BatchWriteResult, MergeStats},
};

// Re-export pipeline components
pub use pipeline::{
    BatchGraphWriter, DeadLetterQueue, DeterministicExtractor, ExtractionCache,
    ExtractionPipeline, FactDiff, InferenceTier, PipelineStatus, ReprocessReport, RunReport,
    SweepReport, SyntacticTier, WindowOutcome,
};

// Re-export stores
pub use stores::{CypherGraphStore, MemoryGraphStore, MemoryKvStore};

#[cfg(feature = "sqlite")]
pub use stores::{SqliteGraphStore, SqliteKvStore};

// Re-export testing utilities
pub use testing::{FlakyGraphStore, MockInference};
