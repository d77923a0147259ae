//! Statistics engine with a per-revision cache.
//!
//! ## Caching
//!
//! Per-generation statistics are the expensive part. The store reads them
//! from a single snapshot, tagged with the revision it reflects, and they are
//! cached in an LRU keyed by `(scope, revision)`. Revisions only grow, even
//! across `delete_scope`, so a cached row set is never served for a later
//! state and no explicit invalidation is needed.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;

use super::dispersion::AncestorDispersion;
use super::duplicates::{rank_duplicates, DuplicatedAncestor};
use super::regression;
use super::{collapse_ratio, GenerationStats, StatsError, StatsSummary};
use crate::store::SosaIndexStore;
use crate::types::Scope;

type CacheKey = (Scope, u64);

/// Reads statistics from a store.
pub struct StatisticsEngine<S: SosaIndexStore> {
    store: Arc<S>,
    cache: Option<Arc<RwLock<LruCache<CacheKey, Arc<Vec<GenerationStats>>>>>>,
}

impl<S: SosaIndexStore> StatisticsEngine<S> {
    /// Create an engine caching up to `cache_entries` scope revisions
    /// (0 disables the cache).
    pub fn new(store: Arc<S>, cache_entries: usize) -> Self {
        let cache = NonZeroUsize::new(cache_entries).map(|size| Arc::new(RwLock::new(LruCache::new(size))));
        Self { store, cache }
    }

    /// Per-generation statistics for generations `1..=last_generation`.
    ///
    /// Empty for a scope that has never been computed.
    pub async fn per_generation_stats(&self, scope: &Scope) -> Result<Arc<Vec<GenerationStats>>, StatsError> {
        let Some(state) = self
            .store
            .scope_state(scope)
            .await
            .map_err(StatsError::from_store)?
        else {
            return Ok(Arc::new(Vec::new()));
        };
        let key = (*scope, state.revision);

        if let Some(cache) = &self.cache {
            if let Some(rows) = cache.read().peek(&key) {
                tracing::debug!(
                    tree_id = scope.tree_id.0,
                    user_id = scope.user_id.0,
                    revision = state.revision,
                    "Generation stats cache hit"
                );
                return Ok(rows.clone());
            }
        }

        let Some(snapshot) = self
            .store
            .generation_summaries(scope)
            .await
            .map_err(StatsError::from_store)?
        else {
            return Ok(Arc::new(Vec::new()));
        };
        let rows: Arc<Vec<GenerationStats>> = Arc::new(
            snapshot
                .rows
                .into_iter()
                .map(|row| {
                    GenerationStats::new(
                        row.generation,
                        row.count,
                        row.cumulative_count,
                        row.distinct_cumulative_count,
                        row.birth_years,
                    )
                })
                .collect(),
        );

        // Keyed by the snapshot's own revision, which may be newer than `state`.
        if let Some(cache) = &self.cache {
            cache.write().put((*scope, snapshot.revision), rows.clone());
        }
        Ok(rows)
    }

    /// Years between generations, from a least-squares fit of average birth
    /// year against generation.
    pub async fn mean_generation_time(&self, scope: &Scope) -> Result<Option<f64>, StatsError> {
        let rows = self.per_generation_stats(scope).await?;
        let points: Vec<(u32, f64)> = rows
            .iter()
            .filter_map(|row| row.birth_years.avg.map(|avg| (row.generation, avg)))
            .collect();
        Ok(regression::mean_generation_time(&points))
    }

    /// Distinct ancestors per branch of `reference_generation`.
    pub async fn ancestor_dispersion(
        &self,
        scope: &Scope,
        reference_generation: u32,
    ) -> Result<AncestorDispersion, StatsError> {
        let max = self.store.max_generation();
        if reference_generation == 0 || reference_generation > max {
            return Err(StatsError::InvalidGeneration {
                generation: reference_generation,
                max,
            });
        }
        let pairs = self
            .store
            .ancestor_pairs_from_generation(scope, reference_generation)
            .await
            .map_err(StatsError::from_store)?;
        Ok(AncestorDispersion::from_pairs(reference_generation, pairs))
    }

    /// Root ancestors held at several numbers, most frequent first.
    pub async fn top_duplicated_root_ancestors(
        &self,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<DuplicatedAncestor>, StatsError> {
        let roots = self
            .store
            .root_ancestors(scope)
            .await
            .map_err(StatsError::from_store)?;
        Ok(rank_duplicates(roots, limit))
    }

    /// Scope-wide totals.
    pub async fn summary(&self, scope: &Scope) -> Result<StatsSummary, StatsError> {
        let state = self
            .store
            .scope_state(scope)
            .await
            .map_err(StatsError::from_store)?;
        let total_entries = self.store.count(scope).await.map_err(StatsError::from_store)?;
        let distinct_individuals = self
            .store
            .distinct_individual_count(scope)
            .await
            .map_err(StatsError::from_store)?;
        let last_generation = self
            .store
            .last_generation(scope)
            .await
            .map_err(StatsError::from_store)?;
        let slots = 2f64.powi(last_generation as i32) - 1.0;

        Ok(StatsSummary {
            scope: *scope,
            proband: state.as_ref().map(|s| s.proband.clone()),
            revision: state.as_ref().map(|s| s.revision),
            total_entries,
            distinct_individuals,
            last_generation,
            completeness: if slots > 0.0 { total_entries as f64 / slots } else { 0.0 },
            pedigree_collapse: collapse_ratio(distinct_individuals, total_entries),
            mean_generation_time: self.mean_generation_time(scope).await?,
        })
    }

    /// Get cache statistics.
    ///
    /// Returns `None` if caching is disabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| {
            let cache = cache.read();
            CacheStats {
                len: cache.len(),
                cap: cache.cap().get(),
            }
        })
    }

    /// Clear the statistics cache.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.write().clear();
        }
    }
}

/// Statistics cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of entries in the cache.
    pub len: usize,
    /// Maximum capacity of the cache.
    pub cap: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::DispersionBucket;
    use crate::store::{InMemorySosaStore, SosaTransaction};
    use crate::types::{IndividualId, SosaEntry, SosaNumber, YearRecord};

    fn scope() -> Scope {
        Scope::new(4, 2)
    }

    fn entry(n: u64, id: &str, birth: Option<i32>) -> SosaEntry {
        let record = birth.map(YearRecord::exact).unwrap_or_else(YearRecord::unknown);
        SosaEntry::new(scope(), SosaNumber::new(n).unwrap(), IndividualId::new(id)).with_birth(record)
    }

    async fn store_with(entries: Vec<SosaEntry>) -> Arc<InMemorySosaStore> {
        let store = Arc::new(InMemorySosaStore::new());
        let mut tx = store.begin(&scope()).await.unwrap();
        tx.insert_or_update(&entries).await.unwrap();
        tx.commit(&IndividualId::new("P")).await.unwrap();
        store
    }

    fn sample() -> Vec<SosaEntry> {
        vec![
            entry(1, "P", Some(1990)),
            entry(2, "F", Some(1962)),
            entry(3, "M", Some(1966)),
            entry(4, "G", Some(1934)),
            entry(6, "G", Some(1934)),
            entry(7, "MM", Some(1940)),
        ]
    }

    #[tokio::test]
    async fn test_uninitialized_scope_is_empty() {
        let engine = StatisticsEngine::new(Arc::new(InMemorySosaStore::new()), 8);
        assert!(engine.per_generation_stats(&scope()).await.unwrap().is_empty());
        assert_eq!(engine.mean_generation_time(&scope()).await.unwrap(), None);
        assert!(engine.top_duplicated_root_ancestors(&scope(), 5).await.unwrap().is_empty());
        let summary = engine.summary(&scope()).await.unwrap();
        assert_eq!(summary.total_entries, 0);
        assert!(summary.revision.is_none());
        assert_eq!(engine.cache_stats().unwrap().len, 0);
    }

    #[tokio::test]
    async fn test_per_generation_rows() {
        let engine = StatisticsEngine::new(store_with(sample()).await, 8);
        let rows = engine.per_generation_stats(&scope()).await.unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].count, 3);
        assert_eq!(rows[2].cumulative_count, 6);
        assert_eq!(rows[2].distinct_cumulative_count, 5);
        assert_eq!(rows[2].birth_years.first, Some(1934));
        assert_eq!(rows[2].birth_years.last, Some(1940));
        assert!((rows[1].birth_years.avg.unwrap() - 1964.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_hit_and_revision_invalidation() {
        let store = store_with(sample()).await;
        let engine = StatisticsEngine::new(store.clone(), 8);

        let first = engine.per_generation_stats(&scope()).await.unwrap();
        let second = engine.per_generation_stats(&scope()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.cache_stats().unwrap().len, 1);

        let mut tx = store.begin(&scope()).await.unwrap();
        tx.delete_ancestors(SosaNumber::new(3).unwrap()).await.unwrap();
        tx.commit(&IndividualId::new("P")).await.unwrap();

        let third = engine.per_generation_stats(&scope()).await.unwrap();
        assert_eq!(third[1].count, 1);
        assert_eq!(engine.cache_stats().unwrap().len, 2);

        engine.clear_cache();
        assert_eq!(engine.cache_stats().unwrap().len, 0);
    }

    #[tokio::test]
    async fn test_recreated_scope_serves_fresh_rows() {
        let store = store_with(sample()).await;
        let engine = StatisticsEngine::new(store.clone(), 8);
        assert_eq!(engine.per_generation_stats(&scope()).await.unwrap().len(), 3);

        store.delete_scope(&scope()).await.unwrap();
        assert!(engine.per_generation_stats(&scope()).await.unwrap().is_empty());

        let mut tx = store.begin(&scope()).await.unwrap();
        tx.insert_or_update(&[entry(1, "F", Some(1962))]).await.unwrap();
        let state = tx.commit(&IndividualId::new("F")).await.unwrap();
        assert_eq!(state.revision, 2);

        let rows = engine.per_generation_stats(&scope()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 1);
        assert_eq!(rows[0].birth_years.first, Some(1962));
    }

    #[tokio::test]
    async fn test_cache_disabled() {
        let engine = StatisticsEngine::new(store_with(sample()).await, 0);
        assert_eq!(engine.per_generation_stats(&scope()).await.unwrap().len(), 3);
        assert!(engine.cache_stats().is_none());
    }

    #[tokio::test]
    async fn test_mean_generation_time_uses_averages() {
        let engine = StatisticsEngine::new(store_with(sample()).await, 8);
        // Averages: 1990, 1964, 1936 -> slope -27.
        let k = engine.mean_generation_time(&scope()).await.unwrap().unwrap();
        assert!((k - 27.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_dispersion_validates_reference() {
        let engine = StatisticsEngine::new(store_with(sample()).await, 8);
        assert!(matches!(
            engine.ancestor_dispersion(&scope(), 0).await,
            Err(StatsError::InvalidGeneration { generation: 0, max: 64 })
        ));
        assert!(matches!(
            engine.ancestor_dispersion(&scope(), 65).await,
            Err(StatsError::InvalidGeneration { .. })
        ));

        let d = engine.ancestor_dispersion(&scope(), 2).await.unwrap();
        assert_eq!(d.get(DispersionBucket::Branch(0)), 1);
        assert_eq!(d.get(DispersionBucket::Branch(1)), 2);
        assert_eq!(d.get(DispersionBucket::Shared), 1);
    }

    #[tokio::test]
    async fn test_summary() {
        let engine = StatisticsEngine::new(store_with(sample()).await, 8);
        let summary = engine.summary(&scope()).await.unwrap();
        assert_eq!(summary.total_entries, 6);
        assert_eq!(summary.distinct_individuals, 5);
        assert_eq!(summary.last_generation, 3);
        assert_eq!(summary.revision, Some(1));
        assert!((summary.completeness - 6.0 / 7.0).abs() < 1e-12);
        assert!(summary.mean_generation_time.is_some());
    }

    #[tokio::test]
    async fn test_duplicated_roots() {
        let engine = StatisticsEngine::new(store_with(sample()).await, 8);
        let top = engine.top_duplicated_root_ancestors(&scope(), 5).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].individual_id.as_str(), "G");
        assert_eq!(top[0].count(), 2);
    }
}
