//! Relationship (directed edge) document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use super::document::{keys, required_str, DECODE_CONTEXT};
use super::{is_reserved, PropertyMap, Value};
use crate::{Error, Result};

/// Address of a relationship in the graph store.
///
/// Relationships are scoped to their source twin, so the key is the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelKey {
    pub source_id: String,
    pub relationship_id: String,
}

impl RelKey {
    pub fn new(source_id: impl Into<String>, relationship_id: impl Into<String>) -> Self {
        Self { source_id: source_id.into(), relationship_id: relationship_id.into() }
    }
}

impl std::fmt::Display for RelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_id, self.relationship_id)
    }
}

/// Which side of a relationship a twin sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Twin is the source.
    Outgoing,
    /// Twin is the target.
    Incoming,
}

/// Canonical form of one relationship row.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDocument {
    pub relationship_id: String,
    pub source_id: String,
    pub target_id: String,
    pub relationship_name: String,
    /// Non-reserved properties. Always empty on a delete document.
    pub properties: PropertyMap,
    pub delete: bool,
}

impl RelationshipDocument {
    /// Relationship with the derived `"<source>-<target>"` identifier.
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_name: impl Into<String>,
    ) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        Self {
            relationship_id: derive_relationship_id(&source_id, &target_id),
            source_id,
            target_id,
            relationship_name: relationship_name.into(),
            properties: PropertyMap::new(),
            delete: false,
        }
    }

    pub fn with_id(mut self, relationship_id: impl Into<String>) -> Self {
        self.relationship_id = relationship_id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn into_delete(mut self) -> Self {
        self.properties.clear();
        self.delete = true;
        self
    }

    pub fn key(&self) -> RelKey {
        RelKey::new(self.source_id.clone(), self.relationship_id.clone())
    }

    /// The `relationship` body sent to the store: target, name, then properties.
    pub fn body(&self) -> Map<String, Json> {
        let mut body = Map::new();
        body.insert(keys::TARGET_ID.into(), Json::String(self.target_id.clone()));
        body.insert(keys::RELATIONSHIP_NAME.into(), Json::String(self.relationship_name.clone()));
        if !self.delete {
            for (k, v) in &self.properties {
                body.insert(k.clone(), v.clone().into());
            }
        }
        body
    }

    /// Wire form: `{"$relationshipId", "$sourceId", "relationship": {...}}`.
    pub fn to_json(&self) -> Json {
        let mut obj = Map::new();
        obj.insert(keys::RELATIONSHIP_ID.into(), Json::String(self.relationship_id.clone()));
        obj.insert(keys::SOURCE_ID.into(), Json::String(self.source_id.clone()));
        obj.insert(keys::RELATIONSHIP.into(), Json::Object(self.body()));
        if self.delete {
            obj.insert(keys::RELATIONSHIP_DELETE.into(), Json::Bool(true));
        }
        Json::Object(obj)
    }

    pub fn from_json(obj: &Map<String, Json>) -> Result<Self> {
        let relationship_id = required_str(obj, keys::RELATIONSHIP_ID)?;
        let source_id = required_str(obj, keys::SOURCE_ID)?;
        let body = obj
            .get(keys::RELATIONSHIP)
            .and_then(Json::as_object)
            .ok_or_else(|| Error::MissingRequiredField {
                batch: DECODE_CONTEXT.into(),
                field: keys::RELATIONSHIP.into(),
            })?;
        let target_id = required_str(body, keys::TARGET_ID)?;
        let relationship_name = required_str(body, keys::RELATIONSHIP_NAME)?;
        let delete = obj
            .get(keys::RELATIONSHIP_DELETE)
            .map(|v| Value::from(v.clone()).is_flag_set())
            .unwrap_or(false);

        let properties = if delete {
            PropertyMap::new()
        } else {
            body.iter()
                .filter(|(k, _)| !is_reserved(k))
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect()
        };

        Ok(Self { relationship_id, source_id, target_id, relationship_name, properties, delete })
    }
}

/// Deterministic relationship identifier: `"<source>-<target>"`.
pub fn derive_relationship_id(source_id: &str, target_id: &str) -> String {
    format!("{source_id}-{target_id}")
}
