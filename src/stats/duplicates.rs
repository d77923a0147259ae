//! Root ancestors reached through several lines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{IndividualId, SosaNumber};

/// A root ancestor occupying more than one Sosa number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatedAncestor {
    /// The ancestor.
    pub individual_id: IndividualId,
    /// Numbers held as a root ancestor, ascending.
    pub sosa_numbers: Vec<SosaNumber>,
}

impl DuplicatedAncestor {
    /// Number of occurrences.
    pub fn count(&self) -> usize {
        self.sosa_numbers.len()
    }

    /// Lowest number held, `None` for an empty list.
    pub fn lowest(&self) -> Option<SosaNumber> {
        self.sosa_numbers.first().copied()
    }
}

/// Rank root ancestors by number of occurrences (descending), then by lowest
/// number, keeping at most `limit`.
///
/// When the group tied at the cutoff would be split, the whole group is
/// dropped, so the result may hold fewer than `limit` ancestors.
pub fn rank_duplicates<I>(roots: I, limit: usize) -> Vec<DuplicatedAncestor>
where
    I: IntoIterator<Item = (SosaNumber, IndividualId)>,
{
    let mut grouped: HashMap<IndividualId, Vec<SosaNumber>> = HashMap::new();
    for (sosa, individual) in roots {
        grouped.entry(individual).or_default().push(sosa);
    }

    let mut ranked: Vec<DuplicatedAncestor> = grouped
        .into_iter()
        .filter(|(_, numbers)| numbers.len() > 1)
        .map(|(individual_id, mut sosa_numbers)| {
            sosa_numbers.sort_unstable();
            DuplicatedAncestor {
                individual_id,
                sosa_numbers,
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.count().cmp(&a.count()).then(a.lowest().cmp(&b.lowest())));

    if ranked.len() > limit {
        let keep = match limit.checked_sub(1) {
            Some(last) if ranked[limit].count() == ranked[last].count() => {
                let tied = ranked[last].count();
                ranked.iter().take_while(|d| d.count() > tied).count()
            }
            _ => limit,
        };
        ranked.truncate(keep);
    }
    ranked
}
