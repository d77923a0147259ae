//! In-memory Sosa store.
//!
//! Committed scopes are immutable snapshots behind an `Arc`: readers clone the
//! pointer and never block writers. A transaction works on a private copy of
//! the scope and swaps it in on commit while holding the scope's writer lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use crate::types::{first_of_generation, FamilyId, IndividualId, Scope, SosaEntry, SosaNumber, MAX_U64_GENERATION};
use super::{
    BirthYearStats, BoxedTransaction, GenerationSnapshot, MissingAncestor, ScopeState, SosaIndexStore,
    SosaTransaction,
};

/// Error type for the in-memory store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InMemoryError {
    /// The transaction was already committed.
    #[error("Transaction already committed for {0}")]
    TransactionClosed(Scope),
    /// An entry of another scope was written through this transaction.
    #[error("Entry for {entry} written through a transaction on {transaction}")]
    ScopeMismatch {
        /// Scope of the transaction.
        transaction: Scope,
        /// Scope of the offending entry.
        entry: Scope,
    },
}

/// One committed scope.
#[derive(Debug)]
struct ScopeData {
    state: ScopeState,
    entries: BTreeMap<SosaNumber, SosaEntry>,
    /// Secondary index: individual -> numbers held.
    by_individual: BTreeMap<IndividualId, BTreeSet<SosaNumber>>,
}

impl ScopeData {
    fn new(state: ScopeState, entries: BTreeMap<SosaNumber, SosaEntry>) -> Self {
        let mut by_individual: BTreeMap<IndividualId, BTreeSet<SosaNumber>> = BTreeMap::new();
        for entry in entries.values() {
            by_individual
                .entry(entry.individual_id.clone())
                .or_default()
                .insert(entry.sosa);
        }
        Self { state, entries, by_individual }
    }

    fn contains(&self, sosa: Option<SosaNumber>) -> bool {
        sosa.map(|s| self.entries.contains_key(&s)).unwrap_or(false)
    }

    fn at_generation(&self, generation: u32) -> impl Iterator<Item = &SosaEntry> + '_ {
        generation_range(&self.entries, generation).map(|(_, e)| e)
    }

    fn last_generation(&self) -> u32 {
        self.entries
            .keys()
            .next_back()
            .map(|s| s.generation())
            .unwrap_or(0)
    }
}

/// Entries whose generation is exactly `generation`.
fn generation_range(
    entries: &BTreeMap<SosaNumber, SosaEntry>,
    generation: u32,
) -> std::collections::btree_map::Range<'_, SosaNumber, SosaEntry> {
    let bounds = SosaNumber::ROOT.subtree_block_at(generation).and_then(|block| {
        let (low, high) = block.into_inner();
        Some((SosaNumber::new(low)?, SosaNumber::new(high)?))
    });
    match bounds {
        Some((low, high)) => entries.range(low..=high),
        // Generation 0 or beyond u64: empty.
        None => entries.range(SosaNumber::ROOT..SosaNumber::ROOT),
    }
}

#[derive(Debug, Default)]
struct Shared {
    scopes: RwLock<BTreeMap<Scope, Arc<ScopeData>>>,
    /// Last revision of deleted scopes, so a recomputed scope never reuses one.
    retired: Mutex<HashMap<Scope, u64>>,
    writer_locks: Mutex<HashMap<Scope, Arc<tokio::sync::Mutex<()>>>>,
}

impl Shared {
    fn snapshot(&self, scope: &Scope) -> Option<Arc<ScopeData>> {
        self.scopes.read().get(scope).cloned()
    }

    async fn lock_scope(&self, scope: &Scope) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.writer_locks.lock();
            Arc::clone(locks.entry(*scope).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the scope's writer lock unless a writer holds or awaits it.
    fn release_lock(&self, scope: &Scope) {
        let mut locks = self.writer_locks.lock();
        if locks.get(scope).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(scope);
        }
    }

    fn last_revision(&self, scope: &Scope) -> u64 {
        match self.snapshot(scope) {
            Some(data) => data.state.revision,
            None => self.retired.lock().get(scope).copied().unwrap_or(0),
        }
    }
}

/// In-memory Sosa store.
///
/// Cloning the store shares the underlying data.
#[derive(Debug, Clone)]
pub struct InMemorySosaStore {
    shared: Arc<Shared>,
    max_generation: u32,
}

impl Default for InMemorySosaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySosaStore {
    /// Create a new empty store able to hold every `u64` Sosa number.
    pub fn new() -> Self {
        Self::with_max_generation(MAX_U64_GENERATION)
    }

    /// Create a store that drops entries deeper than `max_generation`.
    pub fn with_max_generation(max_generation: u32) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            max_generation: max_generation.clamp(1, MAX_U64_GENERATION),
        }
    }

    /// All committed entries of a scope, ordered by sosa.
    pub fn entries(&self, scope: &Scope) -> Vec<SosaEntry> {
        self.shared
            .snapshot(scope)
            .map(|data| data.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of scopes with committed state.
    pub fn num_scopes(&self) -> usize {
        self.shared.scopes.read().len()
    }

    #[cfg(test)]
    fn num_writer_locks(&self) -> usize {
        self.shared.writer_locks.lock().len()
    }
}

/// Write transaction on the in-memory store.
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    scope: Scope,
    entries: BTreeMap<SosaNumber, SosaEntry>,
    state: Option<ScopeState>,
    previous_revision: u64,
    max_generation: u32,
    closed: bool,
    _writer: OwnedMutexGuard<()>,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> Result<(), InMemoryError> {
        if self.closed {
            return Err(InMemoryError::TransactionClosed(self.scope));
        }
        Ok(())
    }
}

#[async_trait]
impl SosaTransaction for InMemoryTransaction {
    type Error = InMemoryError;

    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn max_generation(&self) -> u32 {
        self.max_generation
    }

    fn state(&self) -> Option<&ScopeState> {
        self.state.as_ref()
    }

    async fn delete_all(&mut self) -> Result<u64, Self::Error> {
        self.ensure_open()?;
        let removed = self.entries.len() as u64;
        self.entries.clear();
        Ok(removed)
    }

    async fn delete_ancestors(&mut self, sosa: SosaNumber) -> Result<u64, Self::Error> {
        self.ensure_open()?;
        let last = self.entries.keys().next_back().map(|s| s.generation()).unwrap_or(0);
        let mut doomed = Vec::new();
        for generation in sosa.generation()..=last {
            let Some(block) = sosa.subtree_block_at(generation) else {
                break;
            };
            let (low, high) = block.into_inner();
            if let (Some(low), Some(high)) = (SosaNumber::new(low), SosaNumber::new(high)) {
                doomed.extend(self.entries.range(low..=high).map(|(s, _)| *s));
            }
        }
        for s in &doomed {
            self.entries.remove(s);
        }
        Ok(doomed.len() as u64)
    }

    async fn insert_or_update(&mut self, batch: &[SosaEntry]) -> Result<usize, Self::Error> {
        self.ensure_open()?;
        let mut written = 0;
        for entry in batch {
            if entry.scope != self.scope {
                return Err(InMemoryError::ScopeMismatch {
                    transaction: self.scope,
                    entry: entry.scope,
                });
            }
            if entry.generation() > self.max_generation {
                continue;
            }
            self.entries.insert(entry.sosa, entry.clone());
            written += 1;
        }
        Ok(written)
    }

    async fn sosa_numbers_of(
        &mut self,
        individual: &IndividualId,
    ) -> Result<BTreeMap<SosaNumber, u32>, Self::Error> {
        self.ensure_open()?;
        Ok(self
            .entries
            .values()
            .filter(|e| &e.individual_id == individual)
            .map(|e| (e.sosa, e.generation()))
            .collect())
    }

    async fn descendants_of(&mut self, sosa: SosaNumber) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error> {
        self.ensure_open()?;
        Ok((1..sosa.generation())
            .filter_map(|generation| sosa.ancestor_at(generation))
            .filter_map(|n| self.entries.get(&n).map(|e| (n, e.individual_id.clone())))
            .collect())
    }

    async fn commit(&mut self, proband: &IndividualId) -> Result<ScopeState, Self::Error> {
        self.ensure_open()?;
        self.closed = true;
        let state = ScopeState {
            proband: proband.clone(),
            revision: self.previous_revision + 1,
            computed_at: Utc::now(),
        };
        let data = ScopeData::new(state.clone(), std::mem::take(&mut self.entries));
        self.shared.scopes.write().insert(self.scope, Arc::new(data));
        self.shared.retired.lock().remove(&self.scope);
        Ok(state)
    }
}

#[async_trait]
impl SosaIndexStore for InMemorySosaStore {
    type Error = InMemoryError;

    fn max_generation(&self) -> u32 {
        self.max_generation
    }

    async fn begin(&self, scope: &Scope) -> Result<BoxedTransaction<Self::Error>, Self::Error> {
        let writer = self.shared.lock_scope(scope).await;
        let previous_revision = self.shared.last_revision(scope);
        let (entries, state) = match self.shared.snapshot(scope) {
            Some(data) => (data.entries.clone(), Some(data.state.clone())),
            None => (BTreeMap::new(), None),
        };
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            scope: *scope,
            entries,
            state,
            previous_revision,
            max_generation: self.max_generation,
            closed: false,
            _writer: writer,
        }))
    }

    async fn scope_state(&self, scope: &Scope) -> Result<Option<ScopeState>, Self::Error> {
        Ok(self.shared.snapshot(scope).map(|data| data.state.clone()))
    }

    async fn generation_summaries(&self, scope: &Scope) -> Result<Option<GenerationSnapshot>, Self::Error> {
        let Some(data) = self.shared.snapshot(scope) else {
            return Ok(None);
        };
        let per_generation = (1..=data.last_generation())
            .map(|generation| {
                let count = data.at_generation(generation).count() as u64;
                let birth_years = BirthYearStats::from_entries(data.at_generation(generation));
                (generation, (count, birth_years))
            })
            .collect();
        let first_generations = data
            .by_individual
            .values()
            .filter_map(|numbers| numbers.first().map(|s| s.generation()));
        Ok(Some(GenerationSnapshot::assemble(
            data.state.revision,
            per_generation,
            first_generations,
        )))
    }

    async fn sosa_numbers_of(
        &self,
        scope: &Scope,
        individual: &IndividualId,
    ) -> Result<BTreeMap<SosaNumber, u32>, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .and_then(|data| {
                data.by_individual
                    .get(individual)
                    .map(|numbers| numbers.iter().map(|s| (*s, s.generation())).collect())
            })
            .unwrap_or_default())
    }

    async fn list_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<BTreeMap<SosaNumber, IndividualId>, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| {
                data.at_generation(generation)
                    .map(|e| (e.sosa, e.individual_id.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn family_pairs_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<BTreeMap<SosaNumber, FamilyId>, Self::Error> {
        let Some(data) = self.shared.snapshot(scope) else {
            return Ok(BTreeMap::new());
        };
        let mut pairs = BTreeMap::new();
        for father in data.at_generation(generation).filter(|e| e.sosa.is_father()) {
            let mother = SosaNumber::new(father.sosa.get() | 1);
            if !data.contains(mother) {
                continue;
            }
            let family = father
                .sosa
                .child()
                .and_then(|c| data.entries.get(&c))
                .and_then(|child| child.parents_family_id.clone());
            if let Some(family) = family {
                pairs.insert(father.sosa, family);
            }
        }
        Ok(pairs)
    }

    async fn missing_parents_at_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<Vec<MissingAncestor>, Self::Error> {
        let Some(data) = self.shared.snapshot(scope) else {
            return Ok(Vec::new());
        };
        if generation < 2 {
            return Ok(Vec::new());
        }
        Ok(data
            .at_generation(generation - 1)
            .filter_map(|child| {
                let has_father = data.contains(child.sosa.father());
                let has_mother = data.contains(child.sosa.mother());
                (!has_father || !has_mother).then(|| MissingAncestor {
                    sosa: child.sosa,
                    individual_id: child.individual_id.clone(),
                    has_father,
                    has_mother,
                })
            })
            .collect())
    }

    async fn last_generation(&self, scope: &Scope) -> Result<u32, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| data.last_generation())
            .unwrap_or(0))
    }

    async fn count(&self, scope: &Scope) -> Result<u64, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| data.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn count_at_generation(&self, scope: &Scope, generation: u32) -> Result<u64, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| data.at_generation(generation).count() as u64)
            .unwrap_or(0))
    }

    async fn count_up_to_generation(&self, scope: &Scope, generation: u32) -> Result<u64, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| {
                data.entries
                    .keys()
                    .take_while(|s| s.generation() <= generation)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn distinct_individual_count(&self, scope: &Scope) -> Result<u64, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| data.by_individual.len() as u64)
            .unwrap_or(0))
    }

    async fn distinct_individual_count_up_to_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<u64, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| {
                data.by_individual
                    .values()
                    .filter(|numbers| {
                        numbers
                            .first()
                            .map(|s| s.generation() <= generation)
                            .unwrap_or(false)
                    })
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn birth_year_stats(&self, scope: &Scope, generation: u32) -> Result<BirthYearStats, Self::Error> {
        Ok(self
            .shared
            .snapshot(scope)
            .map(|data| BirthYearStats::from_entries(data.at_generation(generation)))
            .unwrap_or_default())
    }

    async fn ancestor_pairs_from_generation(
        &self,
        scope: &Scope,
        generation: u32,
    ) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error> {
        let Some(data) = self.shared.snapshot(scope) else {
            return Ok(Vec::new());
        };
        if generation > MAX_U64_GENERATION {
            return Ok(Vec::new());
        }
        let start = SosaNumber::new(first_of_generation(generation.max(1))).unwrap_or(SosaNumber::ROOT);
        Ok(data
            .entries
            .range(start..)
            .map(|(s, e)| (*s, e.individual_id.clone()))
            .collect())
    }

    async fn root_ancestors(&self, scope: &Scope) -> Result<Vec<(SosaNumber, IndividualId)>, Self::Error> {
        let Some(data) = self.shared.snapshot(scope) else {
            return Ok(Vec::new());
        };
        Ok(data
            .entries
            .values()
            .filter(|e| !data.contains(e.sosa.father()) && !data.contains(e.sosa.mother()))
            .map(|e| (e.sosa, e.individual_id.clone()))
            .collect())
    }

    async fn delete_scope(&self, scope: &Scope) -> Result<u64, Self::Error> {
        let writer = self.shared.lock_scope(scope).await;
        let removed = self.shared.scopes.write().remove(scope);
        if let Some(data) = &removed {
            self.shared.retired.lock().insert(*scope, data.state.revision);
        }
        drop(writer);
        self.shared.release_lock(scope);
        Ok(removed.map(|data| data.entries.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scope() -> Scope {
        Scope::new(1, 1)
    }

    fn entry(sosa: u64, id: &str) -> SosaEntry {
        SosaEntry::new(scope(), SosaNumber::new(sosa).unwrap(), IndividualId::new(id))
    }

    fn s(v: u64) -> SosaNumber {
        SosaNumber::new(v).unwrap()
    }

    async fn seeded(numbers: &[u64]) -> InMemorySosaStore {
        let store = InMemorySosaStore::new();
        let batch: Vec<_> = numbers.iter().map(|n| entry(*n, &format!("I{}", n))).collect();
        let mut tx = store.begin(&scope()).await.unwrap();
        tx.insert_or_update(&batch).await.unwrap();
        tx.commit(&IndividualId::new("I1")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_uninitialized_reads_are_empty() {
        let store = InMemorySosaStore::new();
        let sc = scope();
        assert!(store.scope_state(&sc).await.unwrap().is_none());
        assert_eq!(store.count(&sc).await.unwrap(), 0);
        assert_eq!(store.last_generation(&sc).await.unwrap(), 0);
        assert!(store.list_at_generation(&sc, 2).await.unwrap().is_empty());
        assert!(store.missing_parents_at_generation(&sc, 2).await.unwrap().is_empty());
        assert_eq!(store.birth_year_stats(&sc, 1).await.unwrap(), BirthYearStats::default());
        assert!(store.root_ancestors(&sc).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = InMemorySosaStore::new();
        {
            let mut tx = store.begin(&scope()).await.unwrap();
            tx.insert_or_update(&[entry(1, "P")]).await.unwrap();
            // Dropped without commit.
        }
        assert_eq!(store.count(&scope()).await.unwrap(), 0);
        assert!(store.scope_state(&scope()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_bumps_revision() {
        let store = seeded(&[1, 2, 3]).await;
        assert_eq!(store.scope_state(&scope()).await.unwrap().unwrap().revision, 1);

        let mut tx = store.begin(&scope()).await.unwrap();
        tx.insert_or_update(&[entry(2, "X")]).await.unwrap();
        let state = tx.commit(&IndividualId::new("I1")).await.unwrap();
        assert_eq!(state.revision, 2);
        assert!(tx.commit(&IndividualId::new("I1")).await.is_err());

        let gen2 = store.list_at_generation(&scope(), 2).await.unwrap();
        assert_eq!(gen2[&s(2)], IndividualId::new("X"));
    }

    #[tokio::test]
    async fn test_entries_beyond_cap_are_skipped() {
        let store = InMemorySosaStore::with_max_generation(2);
        let mut tx = store.begin(&scope()).await.unwrap();
        let written = tx
            .insert_or_update(&[entry(1, "A"), entry(3, "B"), entry(4, "C")])
            .await
            .unwrap();
        assert_eq!(written, 2);
        tx.commit(&IndividualId::new("A")).await.unwrap();
        assert_eq!(store.count(&scope()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scope_mismatch_is_rejected() {
        let store = InMemorySosaStore::new();
        let mut tx = store.begin(&scope()).await.unwrap();
        let foreign = SosaEntry::new(Scope::new(2, 2), s(1), IndividualId::new("P"));
        assert!(matches!(
            tx.insert_or_update(&[foreign]).await,
            Err(InMemoryError::ScopeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_ancestors_subtree() {
        let store = seeded(&[1, 2, 3, 4, 5, 6, 7, 10, 11, 12, 13, 20]).await;
        let mut tx = store.begin(&scope()).await.unwrap();
        let removed = tx.delete_ancestors(s(2)).await.unwrap();
        assert_eq!(removed, 6); // 2, 4, 5, 10, 11, 20
        tx.commit(&IndividualId::new("I1")).await.unwrap();

        let remaining: Vec<u64> = store.entries(&scope()).iter().map(|e| e.sosa.get()).collect();
        assert_eq!(remaining, vec![1, 3, 6, 7, 12, 13]);
    }

    #[tokio::test]
    async fn test_counts_and_distinct() {
        let store = InMemorySosaStore::new();
        let mut tx = store.begin(&scope()).await.unwrap();
        // Same individual at 4 and 6 (pedigree collapse).
        tx.insert_or_update(&[entry(1, "P"), entry(2, "F"), entry(3, "M"), entry(4, "G"), entry(6, "G")])
            .await
            .unwrap();
        tx.commit(&IndividualId::new("P")).await.unwrap();
        let sc = scope();

        assert_eq!(store.count(&sc).await.unwrap(), 5);
        assert_eq!(store.count_at_generation(&sc, 3).await.unwrap(), 2);
        assert_eq!(store.count_up_to_generation(&sc, 2).await.unwrap(), 3);
        assert_eq!(store.distinct_individual_count(&sc).await.unwrap(), 4);
        assert_eq!(store.distinct_individual_count_up_to_generation(&sc, 2).await.unwrap(), 3);
        assert_eq!(store.last_generation(&sc).await.unwrap(), 3);

        let numbers = store.sosa_numbers_of(&sc, &IndividualId::new("G")).await.unwrap();
        assert_eq!(numbers.into_iter().collect::<Vec<_>>(), vec![(s(4), 3), (s(6), 3)]);
    }

    #[tokio::test]
    async fn test_missing_parents_and_roots() {
        let store = seeded(&[1, 2, 3, 4, 7]).await;
        let sc = scope();

        let missing = store.missing_parents_at_generation(&sc, 3).await.unwrap();
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].sosa, s(2));
        assert!(missing[0].has_father && !missing[0].has_mother);
        assert_eq!(missing[1].sosa, s(3));
        assert!(!missing[1].has_father && missing[1].has_mother);

        assert!(store.missing_parents_at_generation(&sc, 2).await.unwrap().is_empty());

        let roots: Vec<u64> = store
            .root_ancestors(&sc)
            .await
            .unwrap()
            .into_iter()
            .map(|(n, _)| n.get())
            .collect();
        assert_eq!(roots, vec![4, 7]);
    }

    #[tokio::test]
    async fn test_family_pairs_need_both_parents_and_family() {
        let store = InMemorySosaStore::new();
        let mut tx = store.begin(&scope()).await.unwrap();
        tx.insert_or_update(&[
            entry(1, "P").with_parents_family(Some(FamilyId::new("F1"))),
            entry(2, "F").with_parents_family(Some(FamilyId::new("F2"))),
            entry(3, "M"),
            entry(4, "GF"),
            entry(5, "GM"),
            entry(6, "MGF"),
        ])
        .await
        .unwrap();
        tx.commit(&IndividualId::new("P")).await.unwrap();

        let gen2 = store.family_pairs_at_generation(&scope(), 2).await.unwrap();
        assert_eq!(gen2.into_iter().collect::<Vec<_>>(), vec![(s(2), FamilyId::new("F1"))]);

        // 6 has no matching mother at 7.
        let gen3 = store.family_pairs_at_generation(&scope(), 3).await.unwrap();
        assert_eq!(gen3.into_iter().collect::<Vec<_>>(), vec![(s(4), FamilyId::new("F2"))]);
    }

    #[tokio::test]
    async fn test_delete_scope() {
        let store = seeded(&[1, 2, 3]).await;
        assert_eq!(store.delete_scope(&scope()).await.unwrap(), 3);
        assert!(store.scope_state(&scope()).await.unwrap().is_none());
        assert_eq!(store.num_scopes(), 0);
        assert_eq!(store.num_writer_locks(), 0);
    }

    #[tokio::test]
    async fn test_revision_survives_delete_scope() {
        let store = seeded(&[1, 2, 3]).await;
        store.delete_scope(&scope()).await.unwrap();

        let mut tx = store.begin(&scope()).await.unwrap();
        assert!(tx.state().is_none());
        tx.insert_or_update(&[entry(1, "I2")]).await.unwrap();
        let state = tx.commit(&IndividualId::new("I2")).await.unwrap();
        assert_eq!(state.revision, 2);
    }

    #[tokio::test]
    async fn test_transaction_sees_state_at_lock_time() {
        let store = seeded(&[1, 2]).await;
        let tx = store.begin(&scope()).await.unwrap();
        let state = tx.state().unwrap();
        assert_eq!(state.proband, IndividualId::new("I1"));
        assert_eq!(state.revision, 1);
    }

    #[tokio::test]
    async fn test_descendants_of_reads_staged_line() {
        let store = seeded(&[1, 2, 5, 10, 11]).await;
        let mut tx = store.begin(&scope()).await.unwrap();
        tx.insert_or_update(&[entry(5, "X")]).await.unwrap();

        let line = tx.descendants_of(s(21)).await.unwrap();
        let line: Vec<(u64, &str)> = line.iter().map(|(n, id)| (n.get(), id.as_str())).collect();
        assert_eq!(line, vec![(1, "I1"), (2, "I2"), (5, "X"), (10, "I10")]);
        assert!(tx.descendants_of(SosaNumber::ROOT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generation_summaries_from_one_snapshot() {
        let store = InMemorySosaStore::new();
        assert!(store.generation_summaries(&scope()).await.unwrap().is_none());

        let mut tx = store.begin(&scope()).await.unwrap();
        tx.insert_or_update(&[entry(1, "P"), entry(2, "F"), entry(3, "M"), entry(4, "G"), entry(6, "G")])
            .await
            .unwrap();
        tx.commit(&IndividualId::new("P")).await.unwrap();

        let snapshot = store.generation_summaries(&scope()).await.unwrap().unwrap();
        assert_eq!(snapshot.revision, 1);
        let counts: Vec<(u64, u64, u64)> = snapshot
            .rows
            .iter()
            .map(|r| (r.count, r.cumulative_count, r.distinct_cumulative_count))
            .collect();
        assert_eq!(counts, vec![(1, 1, 1), (2, 3, 3), (2, 5, 4)]);
    }

    #[tokio::test]
    async fn test_delete_scope_waits_for_writer() {
        let store = seeded(&[1]).await;
        let tx = store.begin(&scope()).await.unwrap();

        let deleter = store.clone();
        let handle = tokio::spawn(async move { deleter.delete_scope(&Scope::new(1, 1)).await.unwrap() });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(tx);
        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(store.num_writer_locks(), 0);
    }

    #[tokio::test]
    async fn test_writers_on_same_scope_are_serialized() {
        let store = InMemorySosaStore::new();
        let tx = store.begin(&scope()).await.unwrap();

        let contender = store.clone();
        let handle = tokio::spawn(async move {
            let mut tx = contender.begin(&Scope::new(1, 1)).await.unwrap();
            tx.commit(&IndividualId::new("B")).await.unwrap()
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(tx);
        let state = handle.await.unwrap();
        assert_eq!(state.revision, 1);
    }

    proptest! {
        #[test]
        fn prop_delete_ancestors_removes_exactly_subtree(
            numbers in proptest::collection::btree_set(1u64..512, 1..80),
            root in 1u64..64,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let remaining = rt.block_on(async {
                let store = seeded(&numbers.iter().copied().collect::<Vec<_>>()).await;
                let mut tx = store.begin(&scope()).await.unwrap();
                tx.delete_ancestors(s(root)).await.unwrap();
                tx.commit(&IndividualId::new("I1")).await.unwrap();
                store.entries(&scope()).into_iter().map(|e| e.sosa.get()).collect::<BTreeSet<_>>()
            });
            let root_gen = s(root).generation();
            for m in &numbers {
                let gm = s(*m).generation();
                let in_subtree = gm >= root_gen && m >> (gm - root_gen) == root;
                prop_assert_eq!(remaining.contains(m), !in_subtree);
            }
        }
    }
}
