//! Computation orchestrator.
//!
//! [`SosaCalculator`] owns the write path: every computation opens one store
//! transaction (which also serializes writers on the scope), walks the
//! lineage graph through [`AncestorTraversal`], flushes entries through a
//! [`BatchWriter`] and commits. Any error, cancellation or timeout drops the
//! transaction, leaving the committed index untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::batch::BatchWriter;
use crate::cancel::{CancellationToken, StopGuard};
use crate::config::SosaConfig;
use crate::source::{Individual, LineageGraphSource};
use crate::store::{SosaIndexStore, SosaTransaction};
use crate::traversal::{AncestorTraversal, TraversalOutcome};
use crate::types::{Anomaly, AnomalyMetrics, IndividualId, NoOpMetrics, Scope, SosaNumber};

/// Errors from computations.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// The scope has never been computed.
    #[error("No proband configured for {0}")]
    NotConfigured(Scope),

    /// The proband cannot be found in the lineage graph.
    #[error("Proband {0} not found in lineage graph")]
    UnresolvedProband(IndividualId),

    /// The individual to recompute cannot be found in the lineage graph.
    #[error("Individual {0} not found in lineage graph")]
    UnresolvedIndividual(IndividualId),

    /// Lineage graph failure.
    #[error("Lineage source error: {0}")]
    Source(String),

    /// Store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Cancelled through the token.
    #[error("Computation cancelled")]
    Cancelled,

    /// The configured timeout elapsed.
    #[error("Computation timed out")]
    TimedOut,
}

impl ComputeError {
    /// Wrap a store error.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::Store(e.to_string())
    }

    /// Wrap a lineage source error.
    pub fn from_source<E: std::error::Error>(e: E) -> Self {
        Self::Source(e.to_string())
    }
}

/// What a computation was asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputeKind {
    /// Whole scope rebuilt from the proband.
    Full,
    /// Subtrees of one individual rebuilt.
    Incremental {
        /// The changed individual.
        individual_id: IndividualId,
        /// Numbers whose subtrees were rebuilt.
        roots: Vec<SosaNumber>,
    },
}

/// Outcome of a committed computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeReport {
    /// Unique run ID.
    pub run_id: String,
    /// Scope computed.
    pub scope: Scope,
    /// Full or incremental.
    pub kind: ComputeKind,
    /// Proband recorded in the scope state.
    pub proband: IndividualId,
    /// Scope revision after commit.
    pub revision: u64,
    /// Entries removed before the traversal.
    pub entries_deleted: u64,
    /// Entries persisted.
    pub entries_written: u64,
    /// Entries dropped for exceeding the store's generation cap.
    pub entries_skipped: u64,
    /// Batches flushed.
    pub batches: u64,
    /// Deepest generation reached.
    pub deepest_generation: u32,
    /// Branches cut by the generation cap.
    pub truncated_branches: u64,
    /// Anomalies found.
    pub anomalies: Vec<Anomaly>,
    /// Wall-clock duration.
    pub elapsed_ms: u64,
}

/// Computes and maintains the Sosa index of scopes.
pub struct SosaCalculator<G: LineageGraphSource, S: SosaIndexStore> {
    source: Arc<G>,
    store: Arc<S>,
    config: SosaConfig,
    metrics: Arc<dyn AnomalyMetrics>,
}

impl<G: LineageGraphSource, S: SosaIndexStore> SosaCalculator<G, S> {
    /// Create a calculator.
    pub fn new(source: Arc<G>, store: Arc<S>, config: SosaConfig) -> Self {
        Self {
            source,
            store,
            config,
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Set the anomaly metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn AnomalyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The store written to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &SosaConfig {
        &self.config
    }

    /// Rebuild the whole index of `scope` from `proband`.
    pub async fn compute_all(&self, scope: &Scope, proband: &IndividualId) -> Result<ComputeReport, ComputeError> {
        self.compute_all_with_token(scope, proband, CancellationToken::new())
            .await
    }

    /// [`compute_all`](Self::compute_all) with a cancellation token.
    pub async fn compute_all_with_token(
        &self,
        scope: &Scope,
        proband: &IndividualId,
        token: CancellationToken,
    ) -> Result<ComputeReport, ComputeError> {
        let guard = StopGuard::new(token, self.config.compute_timeout());
        self.bounded(self.run_full(scope, Some(proband), &guard)).await
    }

    /// Rebuild the whole index from the proband recorded in the scope state.
    ///
    /// The proband is read under the scope lock, so a computation committed
    /// just before this one sets the proband used here.
    pub async fn recompute(&self, scope: &Scope) -> Result<ComputeReport, ComputeError> {
        let guard = StopGuard::new(CancellationToken::new(), self.config.compute_timeout());
        self.bounded(self.run_full(scope, None, &guard)).await
    }

    /// Rebuild the ancestor subtrees of every number held by `individual`.
    pub async fn compute_from_individual(
        &self,
        scope: &Scope,
        individual: &IndividualId,
    ) -> Result<ComputeReport, ComputeError> {
        self.compute_from_individual_with_token(scope, individual, CancellationToken::new())
            .await
    }

    /// [`compute_from_individual`](Self::compute_from_individual) with a
    /// cancellation token.
    pub async fn compute_from_individual_with_token(
        &self,
        scope: &Scope,
        individual: &IndividualId,
        token: CancellationToken,
    ) -> Result<ComputeReport, ComputeError> {
        let guard = StopGuard::new(token, self.config.compute_timeout());
        self.bounded(self.run_incremental(scope, individual, &guard))
            .await
    }

    /// Remove a scope's entries and state. Returns the number of entries removed.
    pub async fn delete_scope(&self, scope: &Scope) -> Result<u64, ComputeError> {
        let removed = self
            .store
            .delete_scope(scope)
            .await
            .map_err(ComputeError::from_store)?;
        tracing::info!(
            tree_id = scope.tree_id.0,
            user_id = scope.user_id.0,
            removed,
            "Deleted sosa scope"
        );
        Ok(removed)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T, ComputeError>>) -> Result<T, ComputeError> {
        match self.config.compute_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ComputeError::TimedOut)?,
            None => fut.await,
        }
    }

    async fn resolve(&self, id: &IndividualId) -> Result<Option<Individual>, ComputeError> {
        self.source
            .resolve_individual(id)
            .await
            .map_err(ComputeError::from_source)
    }

    /// Full rebuild. Without an explicit proband, the one committed for the
    /// scope is used.
    async fn run_full(
        &self,
        scope: &Scope,
        proband: Option<&IndividualId>,
        guard: &StopGuard,
    ) -> Result<ComputeReport, ComputeError> {
        let start = Instant::now();
        let mut tx = self.store.begin(scope).await.map_err(ComputeError::from_store)?;
        let proband = match proband {
            Some(id) => id.clone(),
            None => tx
                .state()
                .map(|state| state.proband.clone())
                .ok_or(ComputeError::NotConfigured(*scope))?,
        };
        let root = self
            .resolve(&proband)
            .await?
            .ok_or_else(|| ComputeError::UnresolvedProband(proband.clone()))?;

        tracing::info!(
            tree_id = scope.tree_id.0,
            user_id = scope.user_id.0,
            proband = %proband,
            "Starting full sosa computation"
        );

        let deleted = tx.delete_all().await.map_err(ComputeError::from_store)?;
        let max_generation = self.config.effective_max_generation(tx.max_generation());

        let (outcome, written, skipped, batches) = {
            let mut writer = BatchWriter::new(tx.as_mut(), self.config.batch_size);
            let traversal = AncestorTraversal::new(self.source.as_ref(), *scope, max_generation, guard);
            let outcome = traversal.run(root, SosaNumber::ROOT, &[], &mut writer).await?;
            writer.flush().await.map_err(ComputeError::from_store)?;
            (outcome, writer.written(), writer.skipped(), writer.flushes())
        };

        let state = tx.commit(&proband).await.map_err(ComputeError::from_store)?;
        let report = self.finish(
            scope,
            ComputeKind::Full,
            state.proband,
            state.revision,
            deleted,
            (written, skipped, batches),
            outcome,
            start,
        );
        Ok(report)
    }

    async fn run_incremental(
        &self,
        scope: &Scope,
        individual: &IndividualId,
        guard: &StopGuard,
    ) -> Result<ComputeReport, ComputeError> {
        let start = Instant::now();
        let root = self
            .resolve(individual)
            .await?
            .ok_or_else(|| ComputeError::UnresolvedIndividual(individual.clone()))?;

        let mut tx = self.store.begin(scope).await.map_err(ComputeError::from_store)?;
        let state = tx.state().cloned().ok_or(ComputeError::NotConfigured(*scope))?;
        let numbers = tx
            .sosa_numbers_of(individual)
            .await
            .map_err(ComputeError::from_store)?;
        if numbers.is_empty() {
            tracing::debug!(
                tree_id = scope.tree_id.0,
                user_id = scope.user_id.0,
                individual = %individual,
                "Individual holds no sosa number, nothing to recompute"
            );
            return Ok(self.finish(
                scope,
                ComputeKind::Incremental {
                    individual_id: individual.clone(),
                    roots: Vec::new(),
                },
                state.proband,
                state.revision,
                0,
                (0, 0, 0),
                TraversalOutcome::default(),
                start,
            ));
        }

        tracing::info!(
            tree_id = scope.tree_id.0,
            user_id = scope.user_id.0,
            individual = %individual,
            numbers = numbers.len(),
            "Starting incremental sosa computation"
        );

        let max_generation = self.config.effective_max_generation(tx.max_generation());
        let mut roots: Vec<SosaNumber> = Vec::new();
        let mut deleted = 0;
        let mut outcome = TraversalOutcome::default();
        let mut counters = (0, 0, 0);

        // Ascending order: a number inside an already rebuilt subtree is
        // covered by that rebuild.
        for sosa in numbers.into_keys() {
            if roots.iter().any(|root| sosa.is_in_subtree_of(*root)) {
                continue;
            }
            deleted += tx.delete_ancestors(sosa).await.map_err(ComputeError::from_store)?;
            let line = tx.descendants_of(sosa).await.map_err(ComputeError::from_store)?;

            let mut writer = BatchWriter::new(tx.as_mut(), self.config.batch_size);
            let traversal = AncestorTraversal::new(self.source.as_ref(), *scope, max_generation, guard);
            outcome.merge(traversal.run(root.clone(), sosa, &line, &mut writer).await?);
            writer.flush().await.map_err(ComputeError::from_store)?;
            counters.0 += writer.written();
            counters.1 += writer.skipped();
            counters.2 += writer.flushes();
            roots.push(sosa);
        }

        let committed = tx.commit(&state.proband).await.map_err(ComputeError::from_store)?;
        Ok(self.finish(
            scope,
            ComputeKind::Incremental {
                individual_id: individual.clone(),
                roots,
            },
            committed.proband,
            committed.revision,
            deleted,
            counters,
            outcome,
            start,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        scope: &Scope,
        kind: ComputeKind,
        proband: IndividualId,
        revision: u64,
        entries_deleted: u64,
        (entries_written, entries_skipped, batches): (u64, u64, u64),
        outcome: TraversalOutcome,
        start: Instant,
    ) -> ComputeReport {
        for anomaly in &outcome.anomalies {
            self.metrics.record_anomaly(anomaly);
        }
        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            tree_id = scope.tree_id.0,
            user_id = scope.user_id.0,
            revision,
            entries_written,
            entries_skipped,
            anomalies = outcome.anomalies.len(),
            elapsed_ms,
            "Sosa computation committed"
        );
        ComputeReport {
            run_id: Uuid::new_v4().to_string(),
            scope: *scope,
            kind,
            proband,
            revision,
            entries_deleted,
            entries_written,
            entries_skipped,
            batches,
            deepest_generation: outcome.deepest_generation,
            truncated_branches: outcome.truncated_branches,
            anomalies: outcome.anomalies,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryLineageGraph;
    use crate::store::InMemorySosaStore;
    use crate::types::{SosaEntry, TestMetrics, YearRecord};
    use std::time::Duration;

    fn scope() -> Scope {
        Scope::new(1, 1)
    }

    fn graph() -> InMemoryLineageGraph {
        let mut g = InMemoryLineageGraph::new();
        for (id, birth) in [("P", 1990), ("F", 1960), ("M", 1962), ("GF", 1930)] {
            g.add_individual(id, YearRecord::exact(birth), YearRecord::unknown());
        }
        g.set_parents("P", "F1", Some("F"), Some("M")).unwrap();
        g.set_parents("F", "F2", Some("GF"), None).unwrap();
        g
    }

    fn calculator(
        graph: InMemoryLineageGraph,
        config: SosaConfig,
    ) -> (SosaCalculator<InMemoryLineageGraph, InMemorySosaStore>, Arc<InMemorySosaStore>) {
        let store = Arc::new(InMemorySosaStore::new());
        let calc = SosaCalculator::new(Arc::new(graph), store.clone(), config);
        (calc, store)
    }

    #[tokio::test]
    async fn test_compute_all_writes_and_commits() {
        let (calc, store) = calculator(graph(), SosaConfig::default());
        let report = calc.compute_all(&scope(), &"P".into()).await.unwrap();

        assert_eq!(report.kind, ComputeKind::Full);
        assert_eq!(report.entries_written, 4);
        assert_eq!(report.revision, 1);
        assert_eq!(report.deepest_generation, 3);
        assert_eq!(store.count(&scope()).await.unwrap(), 4);

        let state = store.scope_state(&scope()).await.unwrap().unwrap();
        assert_eq!(state.proband.as_str(), "P");
    }

    #[tokio::test]
    async fn test_unresolved_proband_leaves_store_untouched() {
        let (calc, store) = calculator(graph(), SosaConfig::default());
        calc.compute_all(&scope(), &"P".into()).await.unwrap();

        let err = calc.compute_all(&scope(), &"nobody".into()).await.unwrap_err();
        assert!(matches!(err, ComputeError::UnresolvedProband(_)));
        assert_eq!(store.count(&scope()).await.unwrap(), 4);
        assert_eq!(store.scope_state(&scope()).await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_recompute_requires_state() {
        let (calc, _) = calculator(graph(), SosaConfig::default());
        let err = calc.recompute(&scope()).await.unwrap_err();
        assert!(matches!(err, ComputeError::NotConfigured(_)));

        let err = calc
            .compute_from_individual(&scope(), &"F".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::NotConfigured(_)));

        calc.compute_all(&scope(), &"P".into()).await.unwrap();
        let report = calc.recompute(&scope()).await.unwrap();
        assert_eq!(report.revision, 2);
        assert_eq!(report.proband.as_str(), "P");
    }

    #[tokio::test]
    async fn test_incremental_uses_proband_committed_before_lock() {
        let mut g = graph();
        g.set_parents("M", "F4", Some("GF"), None).unwrap();
        let (calc, store) = calculator(g, SosaConfig::default());
        let calc = Arc::new(calc);
        calc.compute_all(&scope(), &"P".into()).await.unwrap();

        // Hold the scope while another writer switches the proband to M.
        let mut held = store.begin(&scope()).await.unwrap();
        let task = {
            let calc = calc.clone();
            tokio::spawn(async move { calc.compute_from_individual(&scope(), &"GF".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        held.delete_all().await.unwrap();
        held.insert_or_update(&[
            SosaEntry::new(scope(), SosaNumber::ROOT, "M".into()),
            SosaEntry::new(scope(), SosaNumber::new(2).unwrap(), "GF".into()),
        ])
        .await
        .unwrap();
        held.commit(&"M".into()).await.unwrap();
        drop(held);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.proband.as_str(), "M");
        assert_eq!(report.kind, ComputeKind::Incremental {
            individual_id: "GF".into(),
            roots: vec![SosaNumber::new(2).unwrap()],
        });
        let state = store.scope_state(&scope()).await.unwrap().unwrap();
        assert_eq!(state.proband.as_str(), "M");
        assert_eq!(state.revision, 3);
    }

    #[tokio::test]
    async fn test_recompute_reads_proband_under_lock() {
        let (calc, store) = calculator(graph(), SosaConfig::default());
        let calc = Arc::new(calc);
        calc.compute_all(&scope(), &"P".into()).await.unwrap();

        let mut held = store.begin(&scope()).await.unwrap();
        let task = {
            let calc = calc.clone();
            tokio::spawn(async move { calc.recompute(&scope()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.delete_all().await.unwrap();
        held.commit(&"F".into()).await.unwrap();
        drop(held);

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.proband.as_str(), "F");
        // F and GF.
        assert_eq!(report.entries_written, 2);
    }

    #[tokio::test]
    async fn test_incremental_matches_full_on_cycle_through_proband() {
        let mut g = InMemoryLineageGraph::new();
        for id in ["P", "A", "B"] {
            g.add_individual(id, YearRecord::unknown(), YearRecord::unknown());
        }
        g.set_parents("P", "F1", Some("A"), None).unwrap();
        g.set_parents("A", "F2", Some("B"), None).unwrap();
        let store = Arc::new(InMemorySosaStore::new());
        SosaCalculator::new(Arc::new(g.clone()), store.clone(), SosaConfig::default())
            .compute_all(&scope(), &"P".into())
            .await
            .unwrap();

        // B's father is then recorded as the proband.
        g.set_parents("B", "F3", Some("P"), None).unwrap();
        let calc = SosaCalculator::new(Arc::new(g), store.clone(), SosaConfig::default());
        let report = calc.compute_from_individual(&scope(), &"B".into()).await.unwrap();
        assert_eq!(report.anomalies.len(), 1);

        let entries: Vec<(u64, String)> = store
            .entries(&scope())
            .into_iter()
            .map(|e| (e.sosa.get(), e.individual_id.to_string()))
            .collect();
        assert_eq!(
            entries,
            vec![(1, "P".to_string()), (2, "A".to_string()), (4, "B".to_string())]
        );
    }

    #[tokio::test]
    async fn test_incremental_skips_individual_outside_index() {
        let mut g = graph();
        g.add_individual("stranger", YearRecord::unknown(), YearRecord::unknown());
        let (calc, _) = calculator(g, SosaConfig::default());
        calc.compute_all(&scope(), &"P".into()).await.unwrap();

        let report = calc
            .compute_from_individual(&scope(), &"stranger".into())
            .await
            .unwrap();
        assert_eq!(report.entries_written, 0);
        assert_eq!(report.revision, 1);
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back() {
        let (calc, store) = calculator(graph(), SosaConfig::default());
        calc.compute_all(&scope(), &"P".into()).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = calc
            .compute_all_with_token(&scope(), &"P".into(), token)
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::Cancelled));
        assert_eq!(store.count(&scope()).await.unwrap(), 4);
        assert_eq!(store.scope_state(&scope()).await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_times_out() {
        let config = SosaConfig {
            compute_timeout_secs: Some(0),
            ..SosaConfig::default()
        };
        let (calc, store) = calculator(graph(), config);
        let err = calc.compute_all(&scope(), &"P".into()).await.unwrap_err();
        assert!(matches!(err, ComputeError::TimedOut));
        assert_eq!(store.count(&scope()).await.unwrap(), 0);
        assert!(calc.config().compute_timeout() == Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_cycle_recorded_in_metrics() {
        let mut g = graph();
        g.set_parents("GF", "F3", Some("P"), None).unwrap();
        let metrics = Arc::new(TestMetrics::default());
        let (calc, _) = calculator(g, SosaConfig::default());
        let calc = calc.with_metrics(metrics.clone());

        let report = calc.compute_all(&scope(), &"P".into()).await.unwrap();
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(metrics.get_count("sosa_cycle_detected_total"), 1);
    }

    #[tokio::test]
    async fn test_configured_cap_truncates() {
        let config = SosaConfig {
            max_generation: Some(2),
            ..SosaConfig::default()
        };
        let (calc, store) = calculator(graph(), config);
        let report = calc.compute_all(&scope(), &"P".into()).await.unwrap();
        assert_eq!(report.entries_written, 3);
        assert_eq!(report.truncated_branches, 1);
        assert_eq!(store.last_generation(&scope()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_scope() {
        let (calc, store) = calculator(graph(), SosaConfig::default());
        calc.compute_all(&scope(), &"P".into()).await.unwrap();
        assert_eq!(calc.delete_scope(&scope()).await.unwrap(), 4);
        assert!(store.scope_state(&scope()).await.unwrap().is_none());
    }
}
