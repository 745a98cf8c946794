//! Normalized proximity-card identifiers.
//!
//! Hardware readers report the same card many ways: `04:a1:b2:c3`,
//! `04-A1-B2-C3`, `04a1b2c3\r`. Everything downstream compares the canonical
//! form only: hex digits, uppercased, separators stripped.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CardError {
    #[error("card id contains no hex digits: {0:?}")]
    Empty(String),
}

/// A card identifier in canonical form (uppercase hex, no separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    /// Normalize a raw reader string: strip every non-hex character and
    /// uppercase the rest. Fails if nothing survives.
    pub fn normalize(raw: &str) -> Result<Self, CardError> {
        let canonical: String = raw
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if canonical.is_empty() {
            return Err(CardError::Empty(raw.to_string()));
        }
        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dashed_lowercase() {
        let id = CardId::normalize("04-a1-b2-c3").unwrap();
        assert_eq!(id.as_str(), "04A1B2C3");
    }

    #[test]
    fn normalizes_colons_and_whitespace() {
        let id = CardId::normalize("  04:A1:b2:C3\r\n").unwrap();
        assert_eq!(id.as_str(), "04A1B2C3");
    }

    #[test]
    fn already_canonical_is_unchanged() {
        let id = CardId::normalize("ABC123").unwrap();
        assert_eq!(id.as_str(), "ABC123");
    }

    #[test]
    fn equal_after_normalization() {
        let a = CardId::normalize("04A1B2C3").unwrap();
        let b = CardId::normalize("04-a1-b2-c3").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_and_non_hex_rejected() {
        assert!(matches!(CardId::normalize(""), Err(CardError::Empty(_))));
        assert!(matches!(CardId::normalize("--::"), Err(CardError::Empty(_))));
    }
}
