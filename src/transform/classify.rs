//! Row classifier: decides, once per batch, what its rows describe.
//!
//! The decision is made from the header row alone. Every row of a batch is
//! built with the same builder; mixing twins and relationships in one batch
//! is not supported.

use serde::{Deserialize, Serialize};

use crate::model::keys;
use crate::{Error, Result};

/// What a batch's rows describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Twins,
    Relationships,
}

impl std::fmt::Display for BatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchKind::Twins => write!(f, "twins"),
            BatchKind::Relationships => write!(f, "relationships"),
        }
    }
}

/// Classify a batch from its header set. First match wins:
///
/// 1. a source marker (`source`, `$sourceId`, or the wire-shaped
///    `relationship.$sourceId` under `separator`) → relationships
/// 2. an entity marker (`id` or `$id`) → twins
/// 3. otherwise → `UnrecognizedFormat`
///
/// Source wins over entity so a relationship file that happens to carry an
/// `id` property column is still read as relationships.
pub fn classify<S: AsRef<str>>(batch: &str, headers: &[S], separator: char) -> Result<BatchKind> {
    let has = |wanted: &str| headers.iter().any(|h| h.as_ref() == wanted);
    let grouped_source = format!("{}{separator}{}", keys::RELATIONSHIP, keys::SOURCE_ID);

    if has(keys::FALLBACK_SOURCE) || has(keys::SOURCE_ID) || has(&grouped_source) {
        Ok(BatchKind::Relationships)
    } else if has(keys::FALLBACK_ID) || has(keys::ID) {
        Ok(BatchKind::Twins)
    } else {
        Err(Error::UnrecognizedFormat { origin: batch.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_headers() {
        assert_eq!(classify("b", &["source", "target"], '.').unwrap(), BatchKind::Relationships);
        assert_eq!(classify("b", &["$sourceId", "target", "w"], '.').unwrap(), BatchKind::Relationships);
    }

    #[test]
    fn test_twin_headers() {
        assert_eq!(classify("b", &["id", "name"], '.').unwrap(), BatchKind::Twins);
        assert_eq!(classify("b", &["$id", "$metadata.$model"], '.').unwrap(), BatchKind::Twins);
    }

    #[test]
    fn test_source_marker_wins_over_id() {
        assert_eq!(classify("b", &["id", "source", "target"], '.').unwrap(), BatchKind::Relationships);
    }

    #[test]
    fn test_unrecognized_names_batch() {
        let err = classify("widgets", &["name", "size"], '.').unwrap_err();
        match err {
            Error::UnrecognizedFormat { origin } => assert_eq!(origin, "widgets"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_grouped_source_marker() {
        let headers = ["$relationshipId", "relationship.$sourceId", "relationship.$targetId"];
        assert_eq!(classify("b", &headers, '.').unwrap(), BatchKind::Relationships);
        let slashed = ["relationship/$sourceId", "relationship/$targetId"];
        assert_eq!(classify("b", &slashed, '/').unwrap(), BatchKind::Relationships);
        assert!(classify("b", &["other.$sourceId"], '.').is_err());
    }

    #[test]
    fn test_target_alone_is_not_a_relationship() {
        assert!(classify("b", &["target"], '.').is_err());
    }
}
