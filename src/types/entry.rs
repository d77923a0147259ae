//! The persisted unit of the Sosa index.

use serde::{Deserialize, Serialize};

use super::ids::{FamilyId, IndividualId, Scope};
use super::sosa::SosaNumber;

/// A year as known by the lineage graph: an exact value from a dated fact,
/// an estimate derived from relatives, or both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRecord {
    /// Year read from a dated fact.
    pub exact: Option<i32>,
    /// Year estimated by the graph.
    pub estimated: Option<i32>,
}

impl YearRecord {
    /// A known year.
    pub fn exact(year: i32) -> Self {
        Self {
            exact: Some(year),
            estimated: None,
        }
    }

    /// An estimated year.
    pub fn estimated(year: i32) -> Self {
        Self {
            exact: None,
            estimated: Some(year),
        }
    }

    /// Nothing known.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// The pair stored on an entry: the exact year, and the estimate only
    /// when the exact year is missing.
    pub fn stored(self) -> (Option<i32>, Option<i32>) {
        match self.exact {
            Some(year) => (Some(year), None),
            None => (None, self.estimated),
        }
    }
}

/// One ancestor position within a scope.
///
/// `(scope, sosa)` is unique. The same individual may hold several entries
/// in one scope (pedigree collapse). The generation is always derived from
/// `sosa`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SosaEntry {
    /// Owning scope.
    pub scope: Scope,
    /// Ancestor number.
    pub sosa: SosaNumber,
    /// Individual at this position.
    pub individual_id: IndividualId,
    /// Birth family of the individual, when the graph records one.
    pub parents_family_id: Option<FamilyId>,
    /// Exact birth year.
    pub birth_year: Option<i32>,
    /// Estimated birth year, set only when `birth_year` is unknown.
    pub birth_year_estimated: Option<i32>,
    /// Exact death year.
    pub death_year: Option<i32>,
    /// Estimated death year, set only when `death_year` is unknown.
    pub death_year_estimated: Option<i32>,
}

impl SosaEntry {
    /// Create an entry with no family and no years.
    pub fn new(scope: Scope, sosa: SosaNumber, individual_id: IndividualId) -> Self {
        Self {
            scope,
            sosa,
            individual_id,
            parents_family_id: None,
            birth_year: None,
            birth_year_estimated: None,
            death_year: None,
            death_year_estimated: None,
        }
    }

    /// Set the birth family.
    pub fn with_parents_family(mut self, family: Option<FamilyId>) -> Self {
        self.parents_family_id = family;
        self
    }

    /// Set birth years from a graph record.
    pub fn with_birth(mut self, record: YearRecord) -> Self {
        (self.birth_year, self.birth_year_estimated) = record.stored();
        self
    }

    /// Set death years from a graph record.
    pub fn with_death(mut self, record: YearRecord) -> Self {
        (self.death_year, self.death_year_estimated) = record.stored();
        self
    }

    /// Generation derived from the Sosa number.
    pub fn generation(&self) -> u32 {
        self.sosa.generation()
    }

    /// Exact birth year, falling back to the estimate.
    pub fn effective_birth_year(&self) -> Option<i32> {
        self.birth_year.or(self.birth_year_estimated)
    }

    /// Exact death year, falling back to the estimate.
    pub fn effective_death_year(&self) -> Option<i32> {
        self.death_year.or(self.death_year_estimated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_stored_only_without_exact() {
        let both = YearRecord {
            exact: Some(1850),
            estimated: Some(1849),
        };
        assert_eq!(both.stored(), (Some(1850), None));
        assert_eq!(YearRecord::estimated(1700).stored(), (None, Some(1700)));
        assert_eq!(YearRecord::unknown().stored(), (None, None));
    }

    #[test]
    fn test_entry_generation_follows_sosa() {
        let entry = SosaEntry::new(
            Scope::new(1, 1),
            SosaNumber::new(6).unwrap(),
            IndividualId::new("I6"),
        )
        .with_birth(YearRecord::estimated(1790))
        .with_death(YearRecord::exact(1850));

        assert_eq!(entry.generation(), 3);
        assert_eq!(entry.effective_birth_year(), Some(1790));
        assert_eq!(entry.birth_year, None);
        assert_eq!(entry.effective_death_year(), Some(1850));
    }
}
