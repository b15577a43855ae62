//! Relationship document builder.

use crate::model::{keys, PropertyMap, RelationshipDocument, Value};
use crate::{Error, Result};

use super::{strip_reserved, take_flag, take_text, BatchSource};

/// Build a relationship from a flattened, coerced row.
///
/// Explicit columns (`$sourceId`, `$targetId`, `$relationshipId`,
/// `$relationshipName`) win over the fallback pair (`source`, `target`) and
/// over derived values. A row already shaped like the wire form, with a
/// `relationship.*` group holding `$targetId` or `$sourceId`, is accepted
/// too; the group's members are merged into the row first.
pub fn build_relationship(mut row: PropertyMap, source: &BatchSource) -> Result<RelationshipDocument> {
    unwrap_body(&mut row);

    let source_id = take_either(&mut row, keys::SOURCE_ID, keys::FALLBACK_SOURCE)
        .ok_or_else(|| missing(source, keys::FALLBACK_SOURCE))?;
    let target_id = take_either(&mut row, keys::TARGET_ID, keys::FALLBACK_TARGET)
        .ok_or_else(|| missing(source, keys::FALLBACK_TARGET))?;

    let name = take_text(&mut row, keys::RELATIONSHIP_NAME).unwrap_or_else(|| source.name.clone());
    let mut rel = RelationshipDocument::new(source_id, target_id, name);
    if let Some(id) = take_text(&mut row, keys::RELATIONSHIP_ID) {
        rel = rel.with_id(id);
    }

    if take_flag(&mut row, keys::RELATIONSHIP_DELETE) {
        return Ok(rel.into_delete());
    }

    rel.properties = strip_reserved(row, &source.name);
    Ok(rel)
}

fn take_either(row: &mut PropertyMap, explicit: &str, fallback: &str) -> Option<String> {
    let explicit = take_text(row, explicit);
    let fallback = take_text(row, fallback);
    explicit.or(fallback)
}

fn missing(source: &BatchSource, field: &str) -> Error {
    Error::MissingRequiredField { batch: source.name.clone(), field: field.into() }
}

/// Hoist a wire-shaped `relationship` group into the row. Top-level columns
/// win on collision.
fn unwrap_body(row: &mut PropertyMap) {
    let is_body = row
        .get(keys::RELATIONSHIP)
        .and_then(Value::as_object)
        .is_some_and(|body| body.contains_key(keys::TARGET_ID) || body.contains_key(keys::SOURCE_ID));
    if !is_body {
        return;
    }
    if let Some(Value::Object(body)) = row.remove(keys::RELATIONSHIP) {
        for (k, v) in body {
            row.entry(k).or_insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::property_map;
    use pretty_assertions::assert_eq;

    fn source() -> BatchSource {
        BatchSource::new("linksTo")
    }

    #[test]
    fn test_fallback_pair_derives_identity() {
        let rel = build_relationship(property_map([("source", "A"), ("target", "B")]), &source()).unwrap();
        assert_eq!(rel.relationship_id, "A-B");
        assert_eq!(rel.source_id, "A");
        assert_eq!(rel.target_id, "B");
        assert_eq!(rel.relationship_name, "linksTo");
        assert!(rel.properties.is_empty());
    }

    #[test]
    fn test_explicit_columns_win() {
        let row = property_map([
            ("$sourceId", "S"),
            ("source", "ignored"),
            ("target", "T"),
            ("$relationshipId", "r-1"),
            ("$relationshipName", "feeds"),
        ]);
        let rel = build_relationship(row, &source()).unwrap();
        assert_eq!(rel.source_id, "S");
        assert_eq!(rel.relationship_id, "r-1");
        assert_eq!(rel.relationship_name, "feeds");
        assert!(rel.properties.is_empty());
    }

    #[test]
    fn test_properties_copied() {
        let mut row = property_map([("source", "A"), ("target", "B")]);
        row.insert("weight".into(), Value::Int(3));
        let rel = build_relationship(row, &source()).unwrap();
        assert_eq!(rel.properties, property_map([("weight", 3)]));
    }

    #[test]
    fn test_missing_target() {
        let err = build_relationship(property_map([("source", "A")]), &source()).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingRequiredField { ref batch, ref field } if batch == "linksTo" && field == "target"
        ));
    }

    #[test]
    fn test_wire_shaped_row() {
        let mut row = property_map([("$relationshipId", "r"), ("$sourceId", "A")]);
        row.insert(
            "relationship".into(),
            Value::Object(property_map([
                ("$targetId", Value::from("B")),
                ("$relationshipName", Value::from("n")),
                ("w", Value::Int(1)),
            ])),
        );
        let rel = build_relationship(row, &source()).unwrap();
        assert_eq!(rel.target_id, "B");
        assert_eq!(rel.relationship_name, "n");
        assert_eq!(rel.properties, property_map([("w", 1)]));
    }

    #[test]
    fn test_grouped_source_and_target() {
        let mut row = property_map([("$relationshipId", "r")]);
        row.insert(
            "relationship".into(),
            Value::Object(property_map([("$sourceId", "A"), ("$targetId", "B")])),
        );
        let rel = build_relationship(row, &source()).unwrap();
        assert_eq!((rel.source_id.as_str(), rel.target_id.as_str()), ("A", "B"));
        assert_eq!(rel.relationship_id, "r");
        assert!(rel.properties.is_empty());
    }

    #[test]
    fn test_plain_relationship_property_is_not_a_body() {
        let mut row = property_map([("source", "A"), ("target", "B")]);
        row.insert("relationship".into(), Value::from("friend"));
        let rel = build_relationship(row, &source()).unwrap();
        assert_eq!(rel.properties.get("relationship"), Some(&Value::from("friend")));
    }

    #[test]
    fn test_delete_marker() {
        let mut row = property_map([("source", "A"), ("target", "B"), ("w", "x")]);
        row.insert("$relationshipDelete".into(), Value::Bool(true));
        let rel = build_relationship(row, &source()).unwrap();
        assert!(rel.delete);
        assert!(rel.properties.is_empty());
    }
}
