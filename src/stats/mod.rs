//! Statistics derived from a committed Sosa index.
//!
//! Everything here reads from a [`SosaIndexStore`](crate::store::SosaIndexStore);
//! the lineage graph is never consulted.

pub mod dispersion;
pub mod duplicates;
pub mod engine;
pub mod regression;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::BirthYearStats;
use crate::types::{IndividualId, Scope};

pub use dispersion::{AncestorDispersion, DispersionBucket};
pub use duplicates::DuplicatedAncestor;
pub use engine::{CacheStats, StatisticsEngine};

/// Errors from statistics queries.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Reference generation outside `1..=max`.
    #[error("Invalid reference generation {generation} (expected 1..={max})")]
    InvalidGeneration {
        /// Requested generation.
        generation: u32,
        /// Highest generation the store can hold.
        max: u32,
    },

    /// Store failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl StatsError {
    /// Wrap a store error.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::Store(e.to_string())
    }
}

/// Statistics of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Generation (1 = proband).
    pub generation: u32,
    /// Entries at this generation.
    pub count: u64,
    /// Entries at generations `1..=generation`.
    pub cumulative_count: u64,
    /// Distinct individuals at generations `1..=generation`.
    pub distinct_cumulative_count: u64,
    /// Slots at this generation, `2^(generation - 1)`.
    pub theoretical_count: u64,
    /// `count / theoretical_count`.
    pub completeness: f64,
    /// `cumulative_count / (2^generation - 1)`.
    pub cumulative_completeness: f64,
    /// Share of cumulative entries that repeat an individual already counted.
    pub pedigree_collapse: f64,
    /// Birth-year aggregates.
    pub birth_years: BirthYearStats,
}

impl GenerationStats {
    /// Derive ratios from raw counts.
    pub fn new(
        generation: u32,
        count: u64,
        cumulative_count: u64,
        distinct_cumulative_count: u64,
        birth_years: BirthYearStats,
    ) -> Self {
        let theoretical_count = crate::types::theoretical_count(generation);
        let cumulative_slots = 2f64.powi(generation as i32) - 1.0;
        Self {
            generation,
            count,
            cumulative_count,
            distinct_cumulative_count,
            theoretical_count,
            completeness: count as f64 / theoretical_count as f64,
            cumulative_completeness: cumulative_count as f64 / cumulative_slots,
            pedigree_collapse: collapse_ratio(distinct_cumulative_count, cumulative_count),
            birth_years,
        }
    }
}

pub(crate) fn collapse_ratio(distinct: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        1.0 - distinct as f64 / total as f64
    }
}

/// Scope-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    /// Scope summarised.
    pub scope: Scope,
    /// Proband, `None` if never computed.
    pub proband: Option<IndividualId>,
    /// Committed revision, `None` if never computed.
    pub revision: Option<u64>,
    /// Total entries.
    pub total_entries: u64,
    /// Distinct individuals.
    pub distinct_individuals: u64,
    /// Deepest generation (0 when empty).
    pub last_generation: u32,
    /// Entries over the slots of generations `1..=last_generation`.
    pub completeness: f64,
    /// Share of entries repeating an individual.
    pub pedigree_collapse: f64,
    /// Estimated years per generation.
    pub mean_generation_time: Option<f64>,
}
