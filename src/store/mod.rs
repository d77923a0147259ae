//! Sosa index storage backends.
//!
//! Writes go through a [`SosaTransaction`] bound to one scope: everything a
//! computation deletes or upserts becomes visible at once on
//! [`SosaTransaction::commit`], and dropping the transaction discards it.
//! Opening a transaction also serializes writers on the same scope.
//!
//! Reads on [`SosaIndexStore`] only see committed data, and return empty or
//! zero results for a scope that has never been computed.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FamilyId, IndividualId, Scope, SosaEntry, SosaNumber};

/// Committed state of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeState {
    /// Proband of the last full computation.
    pub proband: IndividualId,
    /// Incremented on every committed computation.
    pub revision: u64,
    /// When the last computation committed.
    pub computed_at: DateTime<Utc>,
}

/// An entry at generation `g - 1` lacking one or both parents at `g`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingAncestor {
    /// Number of the child.
    pub sosa: SosaNumber,
    /// The child.
    pub individual_id: IndividualId,
    /// Whether the father entry (`2 * sosa`) exists.
    pub has_father: bool,
    /// Whether the mother entry (`2 * sosa + 1`) exists.
    pub has_mother: bool,
}

/// Birth-year aggregates for one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BirthYearStats {
    /// Earliest exact birth year.
    pub first: Option<i32>,
    /// Earliest birth year, estimates included.
    pub first_estimated: Option<i32>,
    /// Average birth year, estimates included.
    pub avg: Option<f64>,
    /// Latest exact birth year.
    pub last: Option<i32>,
    /// Latest birth year, estimates included.
    pub last_estimated: Option<i32>,
}

impl BirthYearStats {
    /// Aggregate from entries of a single generation.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a SosaEntry>) -> Self {
        let mut stats = Self::default();
        let mut sum = 0i64;
        let mut n = 0i64;
        for entry in entries {
            if let Some(year) = entry.birth_year {
                stats.first = Some(stats.first.map_or(year, |y| y.min(year)));
                stats.last = Some(stats.last.map_or(year, |y| y.max(year)));
            }
            if let Some(year) = entry.effective_birth_year() {
                stats.first_estimated = Some(stats.first_estimated.map_or(year, |y| y.min(year)));
                stats.last_estimated = Some(stats.last_estimated.map_or(year, |y| y.max(year)));
                sum += i64::from(year);
                n += 1;
            }
        }
        if n > 0 {
            stats.avg = Some(sum as f64 / n as f64);
        }
        stats
    }
}

/// Counts and birth-year aggregates of one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationCounts {
    /// Generation (1 = proband).
    pub generation: u32,
    /// Entries at this generation.
    pub count: u64,
    /// Entries at generations `1..=generation`.
    pub cumulative_count: u64,
    /// Distinct individuals at generations `1..=generation`.
    pub distinct_cumulative_count: u64,
    /// Birth-year aggregates at this generation.
    pub birth_years: BirthYearStats,
}

/// Per-generation rows read from one committed revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    /// Revision the rows were read at.
    pub revision: u64,
    /// Generations `1..=last_generation`, ascending.
    pub rows: Vec<GenerationCounts>,
}

impl GenerationSnapshot {
    /// Assemble rows from per-generation entry counts and birth-year
    /// aggregates, and from the generation at which each distinct individual
    /// first appears.
    pub fn assemble(
        revision: u64,
        per_generation: BTreeMap<u32, (u64, BirthYearStats)>,
        first_generations: impl IntoIterator<Item = u32>,
    ) -> Self {
        let last = per_generation.keys().next_back().copied().unwrap_or(0);
        let mut first_seen: BTreeMap<u32, u64> = BTreeMap::new();
        for generation in first_generations {
            *first_seen.entry(generation).or_default() += 1;
        }

        let mut rows = Vec::with_capacity(last as usize);
        let (mut cumulative, mut distinct) = (0u64, 0u64);
        for generation in 1..=last {
            let (count, birth_years) = per_generation.get(&generation).cloned().unwrap_or_default();
            cumulative += count;
            distinct += first_seen.get(&generation).copied().unwrap_or(0);
            rows.push(GenerationCounts {
                generation,
                count,
                cumulative_count: cumulative,
                distinct_cumulative_count: distinct,
                birth_years,
            });
        }
        Self { revision, rows }
    }
}

/// A write transaction on one scope.
#[async_trait]
pub trait SosaTransaction: Send {
    /// Error type for transaction operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Scope this transaction writes to.
    fn scope(&self) -> &Scope;

    /// Highest generation this backend can persist.
    fn max_generation(&self) -> u32;

    /// Committed state as of the moment the scope lock was taken, `None` if
    /// the scope was never computed.
    fn state(&self) -> Option<&ScopeState>;

    /// Remove every entry of the scope. Returns the number removed.
    async fn delete_all(&mut self) -> Result<u64, Self::Error>;

    /// Remove `sosa` and every entry in its ancestor subtree, i.e. each `m`
    /// with `floor(m / 2^(gen(m) - gen(sosa))) == sosa`.
    async fn delete_ancestors(&mut self, sosa: SosaNumber) -> Result<u64, Self::Error>;

    /// Upsert a batch. Entries above [`max_generation`](Self::max_generation)
    /// are skipped. Returns the number of entries written.
    async fn insert_or_update(&mut self, batch: &[SosaEntry]) -> Result<usize, Self::Error>;

    /// Numbers held by `individual`, including uncommitted writes.
    async fn sosa_numbers_of(
        &mut self,
        individual: &IndividualId,
    ) -> Result<BTreeMap<SosaNumber, u32>, Self::Error>;

    /// Entries on the line from the proband down to the child of `sosa`
    /// (the numbers `sosa.ancestor_at(g)` for `g < gen(sosa)`), proband
    /// first, including uncommitted writes.
    async fn descendants_of(&mut self, sosa: SosaNumber) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error>;

    /// Publish all changes and record `proband` in the scope state.
    ///
    /// The transaction cannot be used afterwards.
    async fn commit(&mut self, proband: &IndividualId) -> Result<ScopeState, Self::Error>;
}

/// Boxed transaction returned by [`SosaIndexStore::begin`].
pub type BoxedTransaction<E> = Box<dyn SosaTransaction<Error = E>>;

/// Trait for Sosa index storage backends.
///
/// Implementations must guarantee deterministic ordering of results.
#[async_trait]
pub trait SosaIndexStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Highest generation this backend can persist.
    fn max_generation(&self) -> u32;

    /// Open a write transaction on `scope`, waiting for any other writer on
    /// the same scope to finish.
    async fn begin(&self, scope: &Scope) -> Result<BoxedTransaction<Self::Error>, Self::Error>;

    /// Committed state of the scope, `None` if it was never computed.
    async fn scope_state(&self, scope: &Scope) -> Result<Option<ScopeState>, Self::Error>;

    /// Per-generation rows for generations `1..=last_generation`, all read
    /// from the same committed revision. `None` if the scope was never computed.
    async fn generation_summaries(&self, scope: &Scope) -> Result<Option<GenerationSnapshot>, Self::Error>;

    /// Numbers held by an individual, with their generation.
    async fn sosa_numbers_of(
        &self,
        scope: &Scope,
        individual: &IndividualId,
    ) -> Result<BTreeMap<SosaNumber, u32>, Self::Error>;

    /// Individuals at one generation.
    async fn list_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<BTreeMap<SosaNumber, IndividualId>, Self::Error>;

    /// Couples at one generation, keyed by the father's number.
    async fn family_pairs_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<BTreeMap<SosaNumber, FamilyId>, Self::Error>;

    /// Entries at `generation - 1` missing a father or a mother at `generation`.
    async fn missing_parents_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<Vec<MissingAncestor>, Self::Error>;

    /// Deepest generation with at least one entry (0 when empty).
    async fn last_generation(&self, scope: &Scope) -> Result<u32, Self::Error>;

    /// Number of entries.
    async fn count(&self, scope: &Scope) -> Result<u64, Self::Error>;

    /// Number of entries at one generation.
    async fn count_at_generation(&self, scope: &Scope, generation: u32) -> Result<u64, Self::Error>;

    /// Number of entries at generations `1..=generation`.
    async fn count_up_to_generation(&self, scope: &Scope, generation: u32) -> Result<u64, Self::Error>;

    /// Number of distinct individuals.
    async fn distinct_individual_count(&self, scope: &Scope) -> Result<u64, Self::Error>;

    /// Number of distinct individuals at generations `1..=generation`.
    async fn distinct_individual_count_up_to_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<u64, Self::Error>;

    /// Birth-year aggregates at one generation.
    async fn birth_year_stats(&self, scope: &Scope, generation: u32) -> Result<BirthYearStats, Self::Error>;

    /// Raw `(sosa, individual)` pairs at generations `>= generation`, ordered by sosa.
    async fn ancestor_pairs_from_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error>;

    /// Entries with neither a father nor a mother entry, ordered by sosa.
    async fn root_ancestors(&self, scope: &Scope) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error>;

    /// Remove a scope entirely (entries and state).
    ///
    /// The scope's revision keeps counting across deletion: the next commit
    /// gets a revision above any the scope had before.
    async fn delete_scope(&self, scope: &Scope) -> Result<u64, Self::Error>;
}

pub use memory::InMemorySosaStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresSosaStore;
