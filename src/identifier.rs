//! Composite keys addressing cache entries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Addresses one cache entry.
///
/// A `None` category marks a one-off operation (e.g. a single mutation)
/// rather than a typed cache slot. Such identifiers still compare
/// structurally, but nothing ever enumerates them by category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
  pub category: Option<String>,
  pub key: String,
}

impl Identifier {
  /// Identifier for a typed cache slot.
  pub fn new(category: impl Into<String>, key: impl Into<String>) -> Self {
    Self {
      category: Some(category.into()),
      key: key.into(),
    }
  }

  /// Identifier for a one-off operation with no category.
  pub fn one_off(key: impl Into<String>) -> Self {
    Self {
      category: None,
      key: key.into(),
    }
  }

  pub fn is_one_off(&self) -> bool {
    self.category.is_none()
  }

  /// Stable fixed-length hash, used as a storage key by backends that
  /// need a single column.
  pub fn cache_hash(&self) -> String {
    let input = match &self.category {
      Some(category) => format!("c:{}:{}", category, self.key),
      None => format!("o:{}", self.key),
    };

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for Identifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.category {
      Some(category) => write!(f, "{}/{}", category, self.key),
      None => write!(f, "~/{}", self.key),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_structural_equality() {
    assert_eq!(Identifier::new("user", "1"), Identifier::new("user", "1"));
    assert_ne!(Identifier::new("user", "1"), Identifier::new("post", "1"));
    assert_ne!(Identifier::new("user", "1"), Identifier::one_off("1"));
    assert_eq!(Identifier::one_off("save"), Identifier::one_off("save"));
    assert!(Identifier::one_off("save").is_one_off());
    assert!(!Identifier::new("user", "1").is_one_off());
  }

  #[test]
  fn test_cache_hash_distinguishes_one_off() {
    // "c:" / "o:" prefixes keep a None category from colliding with a
    // category that happens to be empty.
    let typed = Identifier::new("", "x");
    let one_off = Identifier::one_off("x");
    assert_ne!(typed.cache_hash(), one_off.cache_hash());
    assert_eq!(typed.cache_hash().len(), 64);
  }

  #[test]
  fn test_display() {
    assert_eq!(Identifier::new("user", "42").to_string(), "user/42");
    assert_eq!(Identifier::one_off("op-1").to_string(), "~/op-1");
  }
}
