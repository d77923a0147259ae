//! Distribution of ancestors across the branches of a reference generation.
//!
//! Each slot of the reference generation roots one branch. An ancestor
//! reached through a single branch is exclusive to it; an ancestor reached
//! through several (pedigree collapse across branches) is shared.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{IndividualId, SosaNumber};

/// Where an ancestor falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DispersionBucket {
    /// Only reached through this branch.
    Branch(u64),
    /// Reached through two or more branches.
    Shared,
}

/// Branches an individual has been seen in.
///
/// Equivalent to a `2^(reference - 1)`-bit mask tested for a single set bit,
/// without allocating the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchMask {
    Single(u64),
    Shared,
}

impl BranchMask {
    fn add(self, branch: u64) -> Self {
        match self {
            Self::Single(b) if b == branch => self,
            _ => Self::Shared,
        }
    }
}

/// Distinct ancestors per branch of a reference generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorDispersion {
    /// Generation whose slots define the branches.
    pub reference_generation: u32,
    /// Exclusive ancestors per branch index (branches without any are absent).
    pub branches: BTreeMap<u64, u64>,
    /// Ancestors found in several branches.
    pub shared: u64,
}

impl AncestorDispersion {
    /// Aggregate raw `(sosa, individual)` pairs. Pairs above the reference
    /// generation are ignored.
    pub fn from_pairs<I>(reference_generation: u32, pairs: I) -> Self
    where
        I: IntoIterator<Item = (SosaNumber, IndividualId)>,
    {
        let mut masks: HashMap<IndividualId, BranchMask> = HashMap::new();
        for (sosa, individual) in pairs {
            let Some(branch) = sosa.branch_index(reference_generation) else {
                continue;
            };
            masks
                .entry(individual)
                .and_modify(|mask| *mask = mask.add(branch))
                .or_insert(BranchMask::Single(branch));
        }

        let mut dispersion = Self {
            reference_generation,
            ..Self::default()
        };
        for mask in masks.into_values() {
            match mask {
                BranchMask::Single(b) => *dispersion.branches.entry(b).or_insert(0) += 1,
                BranchMask::Shared => dispersion.shared += 1,
            }
        }
        dispersion
    }

    /// Count for one bucket.
    pub fn get(&self, bucket: DispersionBucket) -> u64 {
        match bucket {
            DispersionBucket::Branch(b) => self.branches.get(&b).copied().unwrap_or(0),
            DispersionBucket::Shared => self.shared,
        }
    }

    /// Non-empty buckets with their counts.
    pub fn buckets(&self) -> BTreeMap<DispersionBucket, u64> {
        let mut buckets: BTreeMap<DispersionBucket, u64> = self
            .branches
            .iter()
            .map(|(b, n)| (DispersionBucket::Branch(*b), *n))
            .collect();
        if self.shared > 0 {
            buckets.insert(DispersionBucket::Shared, self.shared);
        }
        buckets
    }

    /// Distinct ancestors counted.
    pub fn total(&self) -> u64 {
        self.branches.values().sum::<u64>() + self.shared
    }
}
