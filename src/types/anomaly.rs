//! Data anomalies surfaced by a computation.
//!
//! Anomalies never abort a computation: the offending branch is abandoned,
//! the anomaly is logged, counted through [`AnomalyMetrics`] and returned to
//! the caller in the compute report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ids::{IndividualId, Scope};
use super::sosa::SosaNumber;

/// Kind of anomaly found while walking the lineage graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnomalyKind {
    /// An individual is recorded as their own ancestor.
    CycleDetected {
        /// Individual reached again on the current path.
        individual_id: IndividualId,
        /// Number the revisit would have been assigned.
        sosa: SosaNumber,
        /// Number the individual already holds on the current path.
        first_seen_at: SosaNumber,
    },
}

impl AnomalyKind {
    /// Metric name for this anomaly kind.
    pub fn metric_name(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "sosa_cycle_detected_total",
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "cycle_detected",
        }
    }
}

/// An anomaly raised during one computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// Unique anomaly ID.
    pub id: String,
    /// When the anomaly was raised.
    pub timestamp: DateTime<Utc>,
    /// Scope being computed.
    pub scope: Scope,
    /// What happened.
    pub kind: AnomalyKind,
    /// Additional context.
    pub context: HashMap<String, String>,
}

impl Anomaly {
    /// Create a new anomaly.
    pub fn new(scope: Scope, kind: AnomalyKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            scope,
            kind,
            context: HashMap::new(),
        }
    }

    /// Add context to the anomaly.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Log this anomaly as a structured event.
    pub fn log(&self) {
        match &self.kind {
            AnomalyKind::CycleDetected {
                individual_id,
                sosa,
                first_seen_at,
            } => tracing::warn!(
                anomaly_id = %self.id,
                tree_id = self.scope.tree_id.0,
                user_id = self.scope.user_id.0,
                individual_id = %individual_id,
                sosa = sosa.get(),
                first_seen_at = first_seen_at.get(),
                context = ?self.context,
                "Lineage cycle detected, branch abandoned"
            ),
        }
    }
}

/// Metrics sink for anomalies.
pub trait AnomalyMetrics: Send + Sync {
    /// Increment a counter by 1.
    fn increment(&self, metric_name: &str, labels: &[(&str, &str)]);

    /// Record an anomaly.
    fn record_anomaly(&self, anomaly: &Anomaly) {
        self.increment(anomaly.kind.metric_name(), &[("kind", anomaly.kind.label())]);
    }
}

/// No-op metrics implementation.
#[derive(Debug, Default)]
pub struct NoOpMetrics;

impl AnomalyMetrics for NoOpMetrics {
    fn increment(&self, _metric_name: &str, _labels: &[(&str, &str)]) {}
}

/// In-memory metrics for testing.
#[derive(Debug, Default)]
pub struct TestMetrics {
    /// Counter values.
    pub counters: parking_lot::Mutex<HashMap<String, u64>>,
}

impl AnomalyMetrics for TestMetrics {
    fn increment(&self, metric_name: &str, labels: &[(&str, &str)]) {
        let key = format!("{}:{:?}", metric_name, labels);
        *self.counters.lock().entry(key).or_insert(0) += 1;
    }
}

impl TestMetrics {
    /// Get the count for a metric.
    pub fn get_count(&self, metric_name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(metric_name))
            .map(|(_, v)| v)
            .sum()
    }
}
