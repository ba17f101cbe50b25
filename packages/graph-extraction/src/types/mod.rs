//! Domain types for the extraction core.

pub mod config;
pub mod dlq;
pub mod document;
pub mod fact;
pub mod write;
