//! Canonical document, the unit handed from the transform stage to the
//! reconciler, and its JSON wire codec.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as Json};

use super::{RelationshipDocument, TwinDocument};
use crate::{Error, Result};

/// Prefix marking metadata keys. Part of the wire contract.
pub const SIGIL: char = '$';

/// Context label used in errors raised while decoding a transported document.
pub(crate) const DECODE_CONTEXT: &str = "<queue message>";

/// Reserved and fallback column/wire keys.
pub mod keys {
    pub const ID: &str = "$id";
    pub const METADATA: &str = "$metadata";
    pub const MODEL: &str = "$model";
    pub const LAST_UPDATE_TIME: &str = "$lastUpdateTime";
    pub const ENTITY_DELETE: &str = "$entityDelete";

    pub const RELATIONSHIP_ID: &str = "$relationshipId";
    pub const SOURCE_ID: &str = "$sourceId";
    pub const TARGET_ID: &str = "$targetId";
    pub const RELATIONSHIP_NAME: &str = "$relationshipName";
    pub const RELATIONSHIP_DELETE: &str = "$relationshipDelete";
    /// Body object of a relationship message.
    pub const RELATIONSHIP: &str = "relationship";

    // Fallback (plain CSV) columns
    pub const FALLBACK_ID: &str = "id";
    pub const FALLBACK_SOURCE: &str = "source";
    pub const FALLBACK_TARGET: &str = "target";
}

/// True for keys excluded from generic property copying.
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(SIGIL)
}

pub(crate) fn required_str(obj: &Map<String, Json>, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(Json::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::MissingRequiredField {
            batch: DECODE_CONTEXT.into(),
            field: key.into(),
        })
}

/// Twin or relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Twin,
    Relationship,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentKind::Twin => write!(f, "twin"),
            DocumentKind::Relationship => write!(f, "relationship"),
        }
    }
}

/// One source row in normalized form, ready for reconciliation.
///
/// Immutable after construction. Identifiers are deterministic functions of
/// the row, so re-running the transform on a redelivered batch yields
/// byte-identical documents.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalDocument {
    Twin(TwinDocument),
    Relationship(RelationshipDocument),
}

impl CanonicalDocument {
    pub fn kind(&self) -> DocumentKind {
        match self {
            CanonicalDocument::Twin(_) => DocumentKind::Twin,
            CanonicalDocument::Relationship(_) => DocumentKind::Relationship,
        }
    }

    /// Twin id, or relationship id.
    pub fn id(&self) -> &str {
        match self {
            CanonicalDocument::Twin(t) => &t.id,
            CanonicalDocument::Relationship(r) => &r.relationship_id,
        }
    }

    pub fn is_delete(&self) -> bool {
        match self {
            CanonicalDocument::Twin(t) => t.delete,
            CanonicalDocument::Relationship(r) => r.delete,
        }
    }

    pub fn as_twin(&self) -> Option<&TwinDocument> {
        match self {
            CanonicalDocument::Twin(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&RelationshipDocument> {
        match self {
            CanonicalDocument::Relationship(r) => Some(r),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            CanonicalDocument::Twin(t) => t.to_json(),
            CanonicalDocument::Relationship(r) => r.to_json(),
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    /// Decode a wire document.
    ///
    /// Discrimination is by field presence: `$relationshipId` means a
    /// relationship, otherwise `$id` means a twin. Anything else is
    /// rejected before it reaches the reconciler.
    pub fn from_json(value: &Json) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| Error::UnrecognizedFormat {
            origin: format!("{DECODE_CONTEXT} (not a JSON object)"),
        })?;
        if obj.contains_key(keys::RELATIONSHIP_ID) {
            Ok(CanonicalDocument::Relationship(RelationshipDocument::from_json(obj)?))
        } else if obj.contains_key(keys::ID) {
            Ok(CanonicalDocument::Twin(TwinDocument::from_json(obj)?))
        } else {
            Err(Error::UnrecognizedFormat { origin: DECODE_CONTEXT.into() })
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Json = serde_json::from_str(s)?;
        Self::from_json(&value)
    }
}

impl From<TwinDocument> for CanonicalDocument {
    fn from(t: TwinDocument) -> Self { CanonicalDocument::Twin(t) }
}

impl From<RelationshipDocument> for CanonicalDocument {
    fn from(r: RelationshipDocument) -> Self { CanonicalDocument::Relationship(r) }
}

impl Serialize for CanonicalDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_discriminates_by_field_presence() {
        let twin = json!({"$id": "a", "$metadata": {"$model": "dtmi:x;1"}});
        let rel = json!({
            "$relationshipId": "a-b",
            "$sourceId": "a",
            "relationship": {"$targetId": "b", "$relationshipName": "n"}
        });

        assert_eq!(CanonicalDocument::from_json(&twin).unwrap().kind(), DocumentKind::Twin);
        assert_eq!(CanonicalDocument::from_json(&rel).unwrap().kind(), DocumentKind::Relationship);
    }

    #[test]
    fn test_unrecognized_document() {
        let err = CanonicalDocument::from_json(&json!({"name": "x"})).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat { .. }));

        let err = CanonicalDocument::from_json(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat { .. }));
    }

    #[test]
    fn test_wire_round_trip_is_stable() {
        let doc: CanonicalDocument = RelationshipDocument::new("s", "t", "n")
            .with_property("w", 1.5)
            .into();
        let encoded = doc.to_json_string().unwrap();
        let decoded = CanonicalDocument::from_json_str(&encoded).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.to_json_string().unwrap(), encoded);
    }

    #[test]
    fn test_reserved_keys() {
        assert!(is_reserved("$id"));
        assert!(is_reserved("$anything"));
        assert!(!is_reserved("id"));
        assert!(!is_reserved("a$b"));
    }
}
