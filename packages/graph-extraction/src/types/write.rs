//! Graph write outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Counts reported by a graph store for one merge operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub nodes_created: usize,
    pub nodes_matched: usize,
    pub edges_created: usize,
    pub edges_matched: usize,
}

impl MergeStats {
    pub fn absorb(&mut self, other: MergeStats) {
        self.nodes_created += other.nodes_created;
        self.nodes_matched += other.nodes_matched;
        self.edges_created += other.edges_created;
        self.edges_matched += other.edges_matched;
    }
}

/// Outcome of a `write_batch` call. Observability only, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchWriteResult {
    /// Commit operations issued against the graph store
    pub commits: usize,

    /// Fact rows committed (entities + relationships)
    pub rows_written: usize,

    /// Relationship rows committed
    pub edges_written: usize,

    /// What the store actually created vs. matched
    pub merge: MergeStats,

    pub duration: Duration,

    /// Commit attempts repeated because of write conflicts
    pub conflict_retries: u32,

    /// Whether any batch had to be split to get past conflicts
    pub shrunk: bool,
}

impl BatchWriteResult {
    pub fn absorb(&mut self, other: BatchWriteResult) {
        self.commits += other.commits;
        self.rows_written += other.rows_written;
        self.edges_written += other.edges_written;
        self.merge.absorb(other.merge);
        self.duration += other.duration;
        self.conflict_retries += other.conflict_retries;
        self.shrunk |= other.shrunk;
    }

    /// Nodes plus edges newly created by this write.
    pub fn created(&self) -> usize {
        self.merge.nodes_created + self.merge.edges_created
    }

    pub fn rows_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return self.rows_written as f64;
        }
        self.rows_written as f64 / secs
    }

    pub fn meets_target(&self, target_rows_per_sec: f64) -> bool {
        self.rows_written == 0 || self.rows_per_second() >= target_rows_per_sec
    }
}
