//! Extraction pipeline - the core of the library.
//!
//! The pipeline runs each document through three tiers:
//! - Tier A: deterministic structured parsing and patterns
//! - Tier B: syntactic extraction over unresolved spans
//! - Tier C: cached, schema-constrained inference over escalations
//!
//! Windows that fail Tier C go to the dead letter queue; facts are merged into
//! the graph by the batch writer, and per-document snapshots drive incremental
//! re-extraction.

pub mod cache;
pub mod deterministic;
pub mod differ;
pub mod dlq;
pub mod inference;
pub mod orchestrator;
pub mod patterns;
pub mod schema;
pub mod syntactic;
pub mod writer;

pub use cache::{cache_key, CacheMeta, CacheStats, ExtractionCache};
pub use deterministic::{DeterministicExtractor, DeterministicOutput};
pub use differ::{diff, ConfidenceChange, FactDiff, FactSnapshot, FactSnapshotStore};
pub use dlq::DeadLetterQueue;
pub use inference::{InferenceTier, WindowOutcome};
pub use orchestrator::{
    ExtractionPipeline, PipelineStatus, ReprocessReport, RunReport, SweepReport, TierStats,
};
pub use patterns::{RelationPattern, Specificity};
pub use schema::{output_schema, parse_reply, validate, InferenceOutput, NormalizedExtraction};
pub use syntactic::{Escalation, EscalationReason, SyntacticOutput, SyntacticTier};
pub use writer::BatchGraphWriter;
