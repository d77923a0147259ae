//! In-memory lineage graph for tests, benchmarks and the CLI.

use std::collections::BTreeMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{FamilyId, IndividualId, YearRecord};
use super::{BirthFamily, Individual, LineageGraphSource};

/// Years between a parent's birth and a child's birth used when a birth year
/// has to be estimated from relatives.
pub const ESTIMATED_GENERATION_GAP: i32 = 30;

/// Error type for the in-memory graph.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// Individual not found.
    #[error("Individual not found: {0}")]
    IndividualNotFound(IndividualId),
    /// Family not found.
    #[error("Family not found: {0}")]
    FamilyNotFound(FamilyId),
}

/// An individual as stored in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualRecord {
    /// Graph reference.
    pub id: IndividualId,
    /// Birth year.
    #[serde(default)]
    pub birth: YearRecord,
    /// Death year.
    #[serde(default)]
    pub death: YearRecord,
}

/// A family as stored in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRecord {
    /// Family reference.
    pub id: FamilyId,
    /// Husband / father.
    #[serde(default)]
    pub father: Option<IndividualId>,
    /// Wife / mother.
    #[serde(default)]
    pub mother: Option<IndividualId>,
    /// Children born into this family.
    #[serde(default)]
    pub children: Vec<IndividualId>,
}

/// Serialized form of a whole graph (used by the `sosa_report` CLI).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PedigreeDocument {
    /// All individuals.
    pub individuals: Vec<IndividualRecord>,
    /// All families.
    #[serde(default)]
    pub families: Vec<FamilyRecord>,
}

/// In-memory lineage graph.
///
/// Uses BTreeMap for deterministic iteration order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLineageGraph {
    individuals: BTreeMap<IndividualId, IndividualRecord>,
    families: BTreeMap<FamilyId, FamilyRecord>,
    /// Child -> birth family.
    birth_families: BTreeMap<IndividualId, FamilyId>,
}

impl InMemoryLineageGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a serialized document.
    pub fn from_document(doc: PedigreeDocument) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for record in doc.individuals {
            graph.individuals.insert(record.id.clone(), record);
        }
        for family in doc.families {
            let children = family.children.clone();
            graph.add_family(family.id.clone(), family.father, family.mother)?;
            for child in children {
                graph.add_child(&family.id, child)?;
            }
        }
        Ok(graph)
    }

    /// Add (or replace) an individual.
    pub fn add_individual(&mut self, id: impl Into<IndividualId>, birth: YearRecord, death: YearRecord) {
        let id = id.into();
        self.individuals.insert(id.clone(), IndividualRecord { id, birth, death });
    }

    /// Add (or replace) a couple. Both spouses must already exist.
    pub fn add_family(
        &mut self,
        id: impl Into<FamilyId>,
        father: Option<IndividualId>,
        mother: Option<IndividualId>,
    ) -> Result<(), GraphError> {
        for spouse in father.iter().chain(mother.iter()) {
            if !self.individuals.contains_key(spouse) {
                return Err(GraphError::IndividualNotFound(spouse.clone()));
            }
        }
        let id = id.into();
        let children = self
            .families
            .get(&id)
            .map(|f| f.children.clone())
            .unwrap_or_default();
        self.families.insert(id.clone(), FamilyRecord { id, father, mother, children });
        Ok(())
    }

    /// Record `child` as born into `family`, replacing any previous birth family.
    pub fn add_child(&mut self, family: &FamilyId, child: impl Into<IndividualId>) -> Result<(), GraphError> {
        let child = child.into();
        if !self.individuals.contains_key(&child) {
            return Err(GraphError::IndividualNotFound(child));
        }
        if !self.families.contains_key(family) {
            return Err(GraphError::FamilyNotFound(family.clone()));
        }
        if let Some(previous) = self.birth_families.insert(child.clone(), family.clone()) {
            if let Some(old) = self.families.get_mut(&previous) {
                old.children.retain(|c| c != &child);
            }
        }
        if let Some(fam) = self.families.get_mut(family) {
            if !fam.children.contains(&child) {
                fam.children.push(child);
            }
        }
        Ok(())
    }

    /// Detach `child` from its birth family.
    pub fn remove_birth_family(&mut self, child: &IndividualId) {
        if let Some(previous) = self.birth_families.remove(child) {
            if let Some(fam) = self.families.get_mut(&previous) {
                fam.children.retain(|c| c != child);
            }
        }
    }

    /// Convenience: create a family for `father` and `mother` and attach `child` to it.
    pub fn set_parents(
        &mut self,
        child: &str,
        family: &str,
        father: Option<&str>,
        mother: Option<&str>,
    ) -> Result<(), GraphError> {
        let family = FamilyId::new(family);
        self.add_family(family.clone(), father.map(IndividualId::new), mother.map(IndividualId::new))?;
        self.add_child(&family, child)
    }

    /// Number of individuals.
    pub fn num_individuals(&self) -> usize {
        self.individuals.len()
    }

    /// Number of families.
    pub fn num_families(&self) -> usize {
        self.families.len()
    }

    fn recorded_birth(&self, id: &IndividualId) -> Option<i32> {
        self.individuals
            .get(id)
            .and_then(|r| r.birth.exact.or(r.birth.estimated))
    }

    /// Estimate a birth year from the closest relatives with a known birth:
    /// the earliest child, else the latest-born parent.
    fn estimate_birth(&self, id: &IndividualId) -> Option<i32> {
        let from_children = self
            .families
            .values()
            .filter(|f| f.father.as_ref() == Some(id) || f.mother.as_ref() == Some(id))
            .flat_map(|f| f.children.iter())
            .filter_map(|c| self.recorded_birth(c))
            .min()
            .map(|year| year - ESTIMATED_GENERATION_GAP);
        if from_children.is_some() {
            return from_children;
        }
        let family = self.birth_families.get(id).and_then(|f| self.families.get(f))?;
        family
            .father
            .iter()
            .chain(family.mother.iter())
            .filter_map(|p| self.recorded_birth(p))
            .max()
            .map(|year| year + ESTIMATED_GENERATION_GAP)
    }
}

#[async_trait]
impl LineageGraphSource for InMemoryLineageGraph {
    type Error = GraphError;

    async fn resolve_individual(&self, id: &IndividualId) -> Result<Option<Individual>, Self::Error> {
        Ok(self
            .individuals
            .contains_key(id)
            .then(|| Individual::new(id.clone())))
    }

    async fn birth_family_of(&self, individual: &Individual) -> Result<Option<BirthFamily>, Self::Error> {
        let Some(family_id) = self.birth_families.get(&individual.id) else {
            return Ok(None);
        };
        let family = self
            .families
            .get(family_id)
            .ok_or_else(|| GraphError::FamilyNotFound(family_id.clone()))?;
        let resolve = |id: &Option<IndividualId>| {
            id.as_ref()
                .filter(|i| self.individuals.contains_key(*i))
                .map(|i| Individual::new(i.clone()))
        };
        Ok(Some(BirthFamily {
            id: family.id.clone(),
            father: resolve(&family.father),
            mother: resolve(&family.mother),
        }))
    }

    async fn birth_year(&self, individual: &Individual) -> Result<YearRecord, Self::Error> {
        let record = self
            .individuals
            .get(&individual.id)
            .ok_or_else(|| GraphError::IndividualNotFound(individual.id.clone()))?;
        let mut birth = record.birth;
        if birth.exact.is_none() && birth.estimated.is_none() {
            birth.estimated = self.estimate_birth(&individual.id);
        }
        Ok(birth)
    }

    async fn death_year(&self, individual: &Individual) -> Result<YearRecord, Self::Error> {
        self.individuals
            .get(&individual.id)
            .map(|r| r.death)
            .ok_or_else(|| GraphError::IndividualNotFound(individual.id.clone()))
    }
}
