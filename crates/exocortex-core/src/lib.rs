//! # Exocortex Core
//!
//! A local, single-node personal memory engine: a long-lived SQLite store of
//! textual memories plus entities, links, and goals, a hybrid retrieval
//! pipeline, and the background maintenance loops that keep the store clean
//! and well-ranked.
//!
//! - **Store**: content-addressed memories with tags, soft delete, supersede
//!   chains, hash and semantic dedup, and chunking for long content.
//! - **Retrieval**: FTS5 lexical search plus embedding similarity, recency,
//!   frequency, usefulness, and graph proximity, fused with weighted
//!   Reciprocal Rank Fusion.
//! - **Maintenance**: consolidation clustering, contradiction detection,
//!   decay/archival, purge with supersede shielding, importance
//!   recalibration, weight tuning, co-retrieval link building, and
//!   retrieval-regression tracking against golden queries.
//!
//! The embedding model is an injected [`embeddings::EmbeddingProvider`];
//! the engine never ships one. Provider failure is never fatal: writes land
//! without a vector, queries degrade to the surviving signals.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use exocortex_core::prelude::*;
//!
//! # fn main() -> exocortex_core::Result<()> {
//! let store = Store::open_in_memory()?;
//! store.set_embedding_provider(Arc::new(HashingProvider::default()));
//!
//! store.create_memory(CreateMemoryInput::new(
//!     "The staging deploy runs every weekday at noon",
//! ))?;
//!
//! let hits = store.search(&SearchQuery::new("staging deploy"))?;
//! assert!(!hits.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod embeddings;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod maintenance;
pub mod regression;
pub mod retrieval;
pub mod scoring;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
pub use storage::{default_db_path, IngestSettings, ScoringSettings, Store};
pub use types::{
    ContentType, Contradiction, ContradictionStatus, CreateGoalInput, CreateMemoryInput,
    CreateMemoryResult, Entity, EntityRelationship, EntityType, Goal, GoalPriority, GoalStatus,
    LinkType, LinkedRef, Memory, MemoryLink, MemorySource, ScoreBreakdown, SearchQuery,
    SearchResult, StoreStats, UpdateMemoryInput,
};

pub use embeddings::{EmbeddingProvider, HashingProvider};
pub use maintenance::{light_pass, run_job, JobKind, Scheduler};
pub use storage::memories::{ImportRecord, ImportReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::embeddings::{EmbeddingProvider, HashingProvider};
    pub use crate::types::{
        ContentType, CreateGoalInput, CreateMemoryInput, CreateMemoryResult, Memory,
        MemorySource, SearchQuery, SearchResult,
    };
    pub use crate::{Error, Result, Store};
}
