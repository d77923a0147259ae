//! Identifier types for the lineage graph and numbering scopes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;

/// Error raised when parsing a graph reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The reference was empty.
    #[error("Reference is empty")]
    Empty,
    /// The reference contains characters outside `[A-Za-z0-9:_.-]` or is too long.
    #[error("Invalid reference: {0:?}")]
    Invalid(String),
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9:_.\-]{1,20}$").expect("reference pattern is valid")
    })
}

fn validate_reference(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if !reference_pattern().is_match(s) {
        return Err(IdError::Invalid(s.to_string()));
    }
    Ok(())
}

/// Reference to an individual in the lineage graph (e.g. `I123`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndividualId(String);

impl IndividualId {
    /// Create an id without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate an id.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        validate_reference(s)?;
        Ok(Self(s.to_string()))
    }

    /// Borrow the raw reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndividualId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IndividualId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for IndividualId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to a family (a couple and their children) in the lineage graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyId(String);

impl FamilyId {
    /// Create an id without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate an id.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        validate_reference(s)?;
        Ok(Self(s.to_string()))
    }

    /// Borrow the raw reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FamilyId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FamilyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a family tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub u32);

/// Identifier of the user owning a numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

/// One ancestor-numbering instance: a tree and the user whose proband is numbered.
///
/// Every store and statistics call takes a scope explicitly; nothing is
/// resolved from process-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Tree being numbered.
    pub tree_id: TreeId,
    /// User who picked the proband.
    pub user_id: UserId,
}

impl Scope {
    /// Create a scope.
    pub fn new(tree_id: u32, user_id: u32) -> Self {
        Self {
            tree_id: TreeId(tree_id),
            user_id: UserId(user_id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree {} / user {}", self.tree_id.0, self.user_id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_xrefs() {
        assert!(IndividualId::parse("I123").is_ok());
        assert!(IndividualId::parse("X_1.a-b:c").is_ok());
        assert!(FamilyId::parse("F7").is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_references() {
        assert_eq!(IndividualId::parse(""), Err(IdError::Empty));
        assert!(matches!(IndividualId::parse("I 12"), Err(IdError::Invalid(_))));
        assert!(matches!(
            FamilyId::parse("F123456789012345678901"),
            Err(IdError::Invalid(_))
        ));
    }

    #[test]
    fn test_scope_ordering_is_tree_then_user() {
        let a = Scope::new(1, 9);
        let b = Scope::new(2, 0);
        assert!(a < b);
        assert_eq!(a.to_string(), "tree 1 / user 9");
    }
}
