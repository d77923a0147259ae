//! # sosa-lineage
//!
//! Sosa-Stradonitz ancestor numbering for genealogical graphs.
//!
//! The proband holds number 1; the father of `n` is `2n` and the mother
//! `2n + 1`. The crate computes that numbering for a chosen proband,
//! persists it per scope, rebuilds only the affected subtrees when an
//! individual's ancestry changes, and derives generational statistics from
//! the persisted index.
//!
//! ## Architecture
//!
//! ```text
//! LineageGraphSource → AncestorTraversal → BatchWriter → SosaTransaction
//!                              ↑                               ↓
//!                       SosaCalculator                   SosaIndexStore
//!                                                              ↓
//!                                                      StatisticsEngine
//! ```
//!
//! ## Guarantees
//!
//! - Same graph + same proband → identical entries
//! - A computation is committed atomically or not at all
//! - Writers on one scope are serialized; readers see committed data only
//! - Cycles in corrupt data abandon the branch and are reported, never loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod calculator;
pub mod cancel;
pub mod canonical;
pub mod config;
pub mod source;
pub mod stats;
pub mod store;
pub mod traversal;
pub mod types;

// Re-exports
pub use batch::BatchWriter;
pub use calculator::{ComputeError, ComputeKind, ComputeReport, SosaCalculator};
pub use cancel::{CancellationToken, Interrupt, StopGuard};
pub use canonical::{canonical_hash, scope_lock_key};
pub use config::SosaConfig;
pub use source::memory::{FamilyRecord, GraphError, IndividualRecord, PedigreeDocument};
pub use source::{BirthFamily, InMemoryLineageGraph, Individual, LineageGraphSource};
pub use stats::{
    AncestorDispersion, DispersionBucket, DuplicatedAncestor, GenerationStats, StatisticsEngine,
    StatsError, StatsSummary,
};
pub use store::memory::InMemoryError;
pub use store::{
    BirthYearStats, BoxedTransaction, GenerationCounts, GenerationSnapshot, InMemorySosaStore, MissingAncestor,
    ScopeState, SosaIndexStore, SosaTransaction,
};
#[cfg(feature = "postgres")]
pub use store::postgres::{PostgresConfig, PostgresError, PostgresSosaStore};
pub use traversal::{AncestorTraversal, TraversalOutcome};
pub use types::{
    Anomaly, AnomalyKind, AnomalyMetrics, FamilyId, IndividualId, NoOpMetrics, Scope, SosaEntry, SosaNumber,
    TestMetrics, TreeId, UserId, YearRecord,
};

/// Schema version of serialized reports.
/// Increment on breaking changes to any report type.
pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";
