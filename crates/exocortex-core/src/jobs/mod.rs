//! Background intelligence jobs.
//!
//! Each job is a function of `(store, options) -> report`, supports
//! `dry_run`, and commits its mutations in a single transaction. Jobs log
//! and swallow their own internal degradations; the scheduler never crashes
//! on a job error.

pub mod consolidation;
pub mod contradiction;
pub mod decay;
pub mod graph;
pub mod importance;
pub mod tuning;

pub use consolidation::{run_consolidation, ConsolidationOptions, ConsolidationReport};
pub use contradiction::{run_contradiction_scan, ContradictionOptions, ContradictionReport};
pub use decay::{run_archive, run_purge, ArchiveOptions, ArchiveReport, PurgeOptions, PurgeReport};
pub use graph::{
    cleanup_co_retrievals, run_co_retrieval_links, run_densify, run_entity_backfill,
    CoRetrievalLinkOptions, CoRetrievalLinkReport, DensifyOptions, DensifyReport,
    EntityBackfillOptions, EntityBackfillReport,
};
pub use importance::{
    run_importance_adjust, run_recalibrate, AdjustOptions, AdjustReport, DistributionStats,
    RecalibrateOptions, RecalibrateReport,
};
pub use tuning::{run_weight_tune, TuneOptions, TuneReport};
