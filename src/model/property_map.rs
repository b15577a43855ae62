//! PropertyMap: the key-value store on twins and relationships.

use std::collections::BTreeMap;
use super::Value;

/// A map of property names to values.
///
/// Ordered by key so serialized documents are byte-stable across retries.
pub type PropertyMap = BTreeMap<String, Value>;

/// Build a [`PropertyMap`] from (key, value) pairs.
pub fn property_map<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> PropertyMap
where
    K: Into<String>,
    V: Into<Value>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}
