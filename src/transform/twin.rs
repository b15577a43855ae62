//! Twin document builder.

use crate::config::SyncConfig;
use crate::model::{keys, PropertyMap, TwinDocument, Value};
use crate::{Error, Result};

use super::{strip_reserved, take_flag, take_text, BatchSource};

/// Build a twin from a flattened, coerced row.
///
/// - `$id` wins over `id`; one of them must be non-empty.
/// - `$metadata.$model` is kept verbatim when present, otherwise
///   synthesized from the batch name and version.
/// - `$entityDelete` set ⇒ delete document with no properties.
pub fn build_twin(mut row: PropertyMap, source: &BatchSource, config: &SyncConfig) -> Result<TwinDocument> {
    let explicit_id = take_text(&mut row, keys::ID);
    let fallback_id = take_text(&mut row, keys::FALLBACK_ID);
    let id = explicit_id.or(fallback_id).ok_or_else(|| Error::MissingRequiredField {
        batch: source.name.clone(),
        field: keys::FALLBACK_ID.into(),
    })?;

    let model = take_model(&mut row)
        .unwrap_or_else(|| source.model_ref(&config.model_namespace, &config.default_version));

    let twin = TwinDocument::new(id, model);
    if take_flag(&mut row, keys::ENTITY_DELETE) {
        return Ok(twin.into_delete());
    }

    Ok(TwinDocument { properties: strip_reserved(row, &source.name), ..twin })
}

fn take_model(row: &mut PropertyMap) -> Option<String> {
    match row.remove(keys::METADATA)? {
        Value::Object(mut metadata) => take_text(&mut metadata, keys::MODEL),
        _ => None,
    }
}
