//! Storage implementations for the key/value and graph ports.
//!
//! Available backends:
//! - `MemoryKvStore` / `MemoryGraphStore` - In-memory storage (always available)
//! - `CypherGraphStore` - Renders batches as Cypher for an injected executor
//! - `SqliteKvStore` / `SqliteGraphStore` - SQLite storage (requires `sqlite` feature)

pub mod cypher;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cypher::{CypherExecutor, CypherGraphStore, CypherStatement};
pub use memory::{MemoryGraphStore, MemoryKvStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteGraphStore, SqliteKvStore};
