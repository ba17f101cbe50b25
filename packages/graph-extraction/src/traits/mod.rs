//! Ports the extraction core depends on.
//!
//! The orchestrator only ever sees these traits; concrete stores and model
//! clients are injected by the application.

pub mod graph;
pub mod inference;
pub mod kv;
pub mod syntactic;
