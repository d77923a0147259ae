//! Core types for the Sosa index.

pub mod anomaly;
pub mod entry;
pub mod ids;
pub mod sosa;

pub use anomaly::{Anomaly, AnomalyKind, AnomalyMetrics, NoOpMetrics, TestMetrics};
pub use entry::{SosaEntry, YearRecord};
pub use ids::{FamilyId, IdError, IndividualId, Scope, TreeId, UserId};
pub use sosa::{first_of_generation, theoretical_count, SosaNumber, ZeroSosaNumber, MAX_U64_GENERATION};
