//! Read-only view of the genealogical graph.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{FamilyId, IndividualId, YearRecord};

/// An individual resolved from the lineage graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Individual {
    /// Graph reference.
    pub id: IndividualId,
}

impl Individual {
    /// Wrap a graph reference.
    pub fn new(id: IndividualId) -> Self {
        Self { id }
    }
}

/// The family an individual was born into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthFamily {
    /// Family reference.
    pub id: FamilyId,
    /// Father, if recorded.
    pub father: Option<Individual>,
    /// Mother, if recorded.
    pub mother: Option<Individual>,
}

/// Trait for lineage graph backends.
///
/// Implementations must be deterministic: the same individual always yields
/// the same birth family, so that traversals are reproducible.
#[async_trait]
pub trait LineageGraphSource: Send + Sync {
    /// Error type for graph lookups.
    type Error: std::error::Error + Send + Sync;

    /// Resolve an individual by reference.
    async fn resolve_individual(&self, id: &IndividualId) -> Result<Option<Individual>, Self::Error>;

    /// Birth family (parents) of an individual.
    async fn birth_family_of(&self, individual: &Individual) -> Result<Option<BirthFamily>, Self::Error>;

    /// Birth year of an individual.
    async fn birth_year(&self, individual: &Individual) -> Result<YearRecord, Self::Error>;

    /// Death year of an individual.
    async fn death_year(&self, individual: &Individual) -> Result<YearRecord, Self::Error>;
}

pub use memory::InMemoryLineageGraph;
