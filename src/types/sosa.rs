//! Sosa-Stradonitz numbers.
//!
//! The proband holds number 1. The father of `n` is `2n` and the mother is
//! `2n + 1`, so a number's binary representation spells the path from the
//! proband: after the leading 1 bit, every 0 is a step to a father and every
//! 1 a step to a mother. The generation of `n` is its bit length.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Largest generation a `u64` Sosa number can express.
pub const MAX_U64_GENERATION: u32 = u64::BITS;

/// A Sosa-Stradonitz ancestor number (always ≥ 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct SosaNumber(u64);

/// Error returned when building a Sosa number from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Sosa numbers start at 1")]
pub struct ZeroSosaNumber;

impl SosaNumber {
    /// The proband.
    pub const ROOT: SosaNumber = SosaNumber(1);

    /// Create a Sosa number, rejecting zero.
    pub fn new(value: u64) -> Option<Self> {
        (value >= 1).then_some(Self(value))
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Generation of this number: `floor(log2(n)) + 1`.
    pub fn generation(self) -> u32 {
        u64::BITS - self.0.leading_zeros()
    }

    /// Number of the father, or `None` if it would not fit in 64 bits.
    pub fn father(self) -> Option<Self> {
        self.0.checked_mul(2).map(Self)
    }

    /// Number of the mother, or `None` if it would not fit in 64 bits.
    pub fn mother(self) -> Option<Self> {
        self.0.checked_mul(2).and_then(|v| v.checked_add(1)).map(Self)
    }

    /// Number of the child through whom this ancestor is reached.
    pub fn child(self) -> Option<Self> {
        Self::new(self.0 / 2)
    }

    /// Whether this number denotes a father (even, excluding the proband).
    pub fn is_father(self) -> bool {
        self.0 % 2 == 0
    }

    /// The ancestor of the proband's line that this number descends from at
    /// `generation`, i.e. `floor(n / 2^(gen(n) - generation))`.
    ///
    /// Returns `None` when `generation` is 0 or deeper than this number.
    pub fn ancestor_at(self, generation: u32) -> Option<Self> {
        let own = self.generation();
        if generation == 0 || generation > own {
            return None;
        }
        Some(Self(self.0 >> (own - generation)))
    }

    /// Whether `self` lies in the ancestor subtree rooted at `root`
    /// (`root` itself included).
    pub fn is_in_subtree_of(self, root: SosaNumber) -> bool {
        self.ancestor_at(root.generation()) == Some(root)
    }

    /// The contiguous block of numbers at `generation` that belong to the
    /// subtree rooted at `self`.
    ///
    /// Returns `None` when `generation` is above this number's generation or
    /// beyond what `u64` can express.
    pub fn subtree_block_at(self, generation: u32) -> Option<RangeInclusive<u64>> {
        let own = self.generation();
        if generation < own || generation > MAX_U64_GENERATION {
            return None;
        }
        let shift = generation - own;
        let low = self.0 << shift;
        let high = low | ((1u64 << shift) - 1);
        Some(low..=high)
    }

    /// Index of the branch this number belongs to among the
    /// `2^(reference - 1)` slots of `reference` generation.
    ///
    /// `b = floor(n / 2^(gen(n) - reference)) - 2^(reference - 1)`.
    pub fn branch_index(self, reference: u32) -> Option<u64> {
        let slot = self.ancestor_at(reference)?;
        Some(slot.0 - first_of_generation(reference))
    }
}

/// First Sosa number of `generation` (`2^(generation - 1)`).
pub fn first_of_generation(generation: u32) -> u64 {
    debug_assert!((1..=MAX_U64_GENERATION).contains(&generation));
    1u64 << (generation - 1)
}

/// Number of ancestor slots at `generation` (`2^(generation - 1)`).
pub fn theoretical_count(generation: u32) -> u64 {
    first_of_generation(generation)
}

impl TryFrom<u64> for SosaNumber {
    type Error = ZeroSosaNumber;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(ZeroSosaNumber)
    }
}

impl From<SosaNumber> for u64 {
    fn from(n: SosaNumber) -> u64 {
        n.0
    }
}

impl fmt::Display for SosaNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
