//! Ancestor traversal.
//!
//! Walks the ancestors of a root individual and assigns Sosa numbers:
//! the father of `n` gets `2n`, the mother `2n + 1`.
//!
//! ## Algorithm
//!
//! 1. Mark the root's already-numbered descendants as on-path, then push the
//!    root at its starting number on an explicit stack
//! 2. Pop a frame:
//!    - If the individual is already on the current path, record a cycle
//!      anomaly and abandon the branch
//!    - Emit the entry, mark the individual as on-path
//!    - Push a path-exit marker, then the mother, then the father, so the
//!      father's subtree is fully visited before the mother's (pre-order)
//! 3. Stop descending at the maximum generation
//!
//! The stack replaces recursion so that deep or corrupt pedigrees cannot
//! exhaust the call stack.

use std::collections::HashMap;

use crate::batch::BatchWriter;
use crate::calculator::ComputeError;
use crate::cancel::{Interrupt, StopGuard};
use crate::source::{Individual, LineageGraphSource};
use crate::types::{Anomaly, AnomalyKind, IndividualId, Scope, SosaEntry, SosaNumber};

/// Summary of one traversal.
#[derive(Debug, Clone, Default)]
pub struct TraversalOutcome {
    /// Entries emitted.
    pub visited: u64,
    /// Deepest generation emitted.
    pub deepest_generation: u32,
    /// Individuals at the generation cap whose parents were not visited.
    pub truncated_branches: u64,
    /// Anomalies found along the way.
    pub anomalies: Vec<Anomaly>,
}

impl TraversalOutcome {
    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: TraversalOutcome) {
        self.visited += other.visited;
        self.deepest_generation = self.deepest_generation.max(other.deepest_generation);
        self.truncated_branches += other.truncated_branches;
        self.anomalies.extend(other.anomalies);
    }
}

enum Frame {
    Visit { individual: Individual, sosa: SosaNumber },
    Leave(IndividualId),
}

/// Ancestor walker bound to one scope and one graph.
pub struct AncestorTraversal<'a, G: LineageGraphSource> {
    source: &'a G,
    scope: Scope,
    max_generation: u32,
    guard: &'a StopGuard,
}

impl<'a, G: LineageGraphSource> AncestorTraversal<'a, G> {
    /// Create a traversal that never emits entries deeper than `max_generation`.
    pub fn new(source: &'a G, scope: Scope, max_generation: u32, guard: &'a StopGuard) -> Self {
        Self {
            source,
            scope,
            max_generation,
            guard,
        }
    }

    /// Walk the ancestors of `root`, numbering it `start`, and push every
    /// entry to `writer`.
    ///
    /// `descendants` holds the entries on the line from the proband down to
    /// `start` (exclusive). Reaching one of them again closes a cycle, exactly
    /// as it would in a walk from the proband.
    pub async fn run<E>(
        &self,
        root: Individual,
        start: SosaNumber,
        descendants: &[(SosaNumber, IndividualId)],
        writer: &mut BatchWriter<'_, E>,
    ) -> Result<TraversalOutcome, ComputeError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut outcome = TraversalOutcome::default();
        if start.generation() > self.max_generation {
            return Ok(outcome);
        }

        let mut path: HashMap<IndividualId, SosaNumber> = HashMap::new();
        for (sosa, id) in descendants {
            path.entry(id.clone()).or_insert(*sosa);
        }
        let root_id = root.id.to_string();
        let mut stack = vec![Frame::Visit {
            individual: root,
            sosa: start,
        }];

        while let Some(frame) = stack.pop() {
            let (individual, sosa) = match frame {
                Frame::Leave(id) => {
                    path.remove(&id);
                    continue;
                }
                Frame::Visit { individual, sosa } => (individual, sosa),
            };

            self.guard.check().map_err(|interrupt| match interrupt {
                Interrupt::Cancelled => ComputeError::Cancelled,
                Interrupt::DeadlineExceeded => ComputeError::TimedOut,
            })?;

            if let Some(first_seen_at) = path.get(&individual.id) {
                let anomaly = Anomaly::new(
                    self.scope,
                    AnomalyKind::CycleDetected {
                        individual_id: individual.id.clone(),
                        sosa,
                        first_seen_at: *first_seen_at,
                    },
                )
                .with_context("root", root_id.as_str())
                .with_context("start", start.to_string());
                anomaly.log();
                outcome.anomalies.push(anomaly);
                continue;
            }

            let family = self
                .source
                .birth_family_of(&individual)
                .await
                .map_err(ComputeError::from_source)?;
            let birth = self
                .source
                .birth_year(&individual)
                .await
                .map_err(ComputeError::from_source)?;
            let death = self
                .source
                .death_year(&individual)
                .await
                .map_err(ComputeError::from_source)?;

            let entry = SosaEntry::new(self.scope, sosa, individual.id.clone())
                .with_parents_family(family.as_ref().map(|f| f.id.clone()))
                .with_birth(birth)
                .with_death(death);
            writer.push(entry).await.map_err(ComputeError::from_store)?;

            outcome.visited += 1;
            outcome.deepest_generation = outcome.deepest_generation.max(sosa.generation());

            let Some(family) = family else {
                continue;
            };
            let has_parents = family.father.is_some() || family.mother.is_some();
            if sosa.generation() >= self.max_generation {
                if has_parents {
                    outcome.truncated_branches += 1;
                }
                continue;
            }

            path.insert(individual.id.clone(), sosa);
            stack.push(Frame::Leave(individual.id));
            if let (Some(mother), Some(n)) = (family.mother, sosa.mother()) {
                stack.push(Frame::Visit {
                    individual: mother,
                    sosa: n,
                });
            }
            if let (Some(father), Some(n)) = (family.father, sosa.father()) {
                stack.push(Frame::Visit {
                    individual: father,
                    sosa: n,
                });
            }
        }

        if outcome.truncated_branches > 0 {
            tracing::debug!(
                tree_id = self.scope.tree_id.0,
                user_id = self.scope.user_id.0,
                truncated = outcome.truncated_branches,
                max_generation = self.max_generation,
                "Traversal stopped at generation cap"
            );
        }

        Ok(outcome)
    }
}
