//! Twin (node) document.

use serde_json::{Map, Value as Json};

use super::document::{keys, required_str, DECODE_CONTEXT};
use super::{is_reserved, PropertyMap, Value};
use crate::{Error, Result};

/// Canonical form of one twin row.
///
/// `id` is never empty and `model` is always populated; builders and the
/// wire decoder both refuse to produce a document otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct TwinDocument {
    pub id: String,
    /// Model reference, e.g. `"dtmi:widget;2"`.
    pub model: String,
    /// Non-reserved properties. Always empty on a delete document.
    pub properties: PropertyMap,
    pub delete: bool,
}

impl TwinDocument {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            properties: PropertyMap::new(),
            delete: false,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Turn this document into a delete document, discarding properties.
    pub fn into_delete(mut self) -> Self {
        self.properties.clear();
        self.delete = true;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Wire form: `{"$id", "$metadata": {"$model"}, ...properties}`.
    pub fn to_json(&self) -> Json {
        let mut obj = Map::new();
        obj.insert(keys::ID.into(), Json::String(self.id.clone()));
        let mut metadata = Map::new();
        metadata.insert(keys::MODEL.into(), Json::String(self.model.clone()));
        obj.insert(keys::METADATA.into(), Json::Object(metadata));
        if self.delete {
            obj.insert(keys::ENTITY_DELETE.into(), Json::Bool(true));
        } else {
            for (k, v) in &self.properties {
                obj.insert(k.clone(), v.clone().into());
            }
        }
        Json::Object(obj)
    }

    pub fn from_json(obj: &Map<String, Json>) -> Result<Self> {
        let id = required_str(obj, keys::ID)?;
        let model = obj
            .get(keys::METADATA)
            .and_then(|m| m.get(keys::MODEL))
            .and_then(Json::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::MissingRequiredField {
                batch: DECODE_CONTEXT.into(),
                field: format!("{}.{}", keys::METADATA, keys::MODEL),
            })?
            .to_owned();
        let delete = obj
            .get(keys::ENTITY_DELETE)
            .map(|v| Value::from(v.clone()).is_flag_set())
            .unwrap_or(false);

        let properties = if delete {
            PropertyMap::new()
        } else {
            obj.iter()
                .filter(|(k, _)| !is_reserved(k))
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect()
        };

        Ok(Self { id, model, properties, delete })
    }
}
