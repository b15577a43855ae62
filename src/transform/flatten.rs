//! Path flattener: rebuilds nested property trees from dotted column names.
//!
//! `"a.b.c" = v` becomes `{a: {b: {c: v}}}`. Sibling paths share their
//! intermediate objects. A path that would have to descend through a leaf,
//! or overwrite an existing leaf or object, is a structural conflict and is
//! rejected rather than resolved by overwriting.

use smallvec::SmallVec;

use crate::model::{PropertyMap, Value};

/// A column whose path collides with an earlier column of the same row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConflict {
    /// The prefix at which the collision was found.
    pub path: String,
}

/// Insert `value` at the path spelled by `column`.
pub fn insert_path(
    root: &mut PropertyMap,
    column: &str,
    separator: char,
    value: Value,
) -> Result<(), PathConflict> {
    let segments: SmallVec<[&str; 4]> = column.split(separator).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(PathConflict { path: column.to_owned() });
    };

    let mut node = root;
    for (depth, segment) in parents.iter().enumerate() {
        let entry = node
            .entry((*segment).to_owned())
            .or_insert_with(|| Value::Object(PropertyMap::new()));
        node = match entry {
            Value::Object(children) => children,
            _ => {
                let prefix = segments[..=depth].join(&separator.to_string());
                return Err(PathConflict { path: prefix });
            }
        };
    }

    if node.contains_key(*last) {
        return Err(PathConflict { path: column.to_owned() });
    }
    node.insert((*last).to_owned(), value);
    Ok(())
}

/// Build a nested property tree from (column, value) cells.
pub fn flatten<I, K>(cells: I, separator: char) -> Result<PropertyMap, PathConflict>
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    let mut root = PropertyMap::new();
    for (column, value) in cells {
        insert_path(&mut root, column.as_ref(), separator, value)?;
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn nested(cells: Vec<(&str, Value)>) -> serde_json::Value {
        Value::Object(flatten(cells, '.').unwrap()).into()
    }

    #[test]
    fn test_deep_path() {
        let out = nested(vec![("eeny.meenie.miney.moe", Value::from("x"))]);
        assert_eq!(out, json!({"eeny": {"meenie": {"miney": {"moe": "x"}}}}));
    }

    #[test]
    fn test_siblings_share_parent() {
        let out = nested(vec![
            ("pos.x", Value::from(1)),
            ("pos.y", Value::from(2)),
            ("name", Value::from("n")),
        ]);
        assert_eq!(out, json!({"pos": {"x": 1, "y": 2}, "name": "n"}));
    }

    #[test]
    fn test_reserved_metadata_column_nests() {
        let out = nested(vec![("$metadata.$model", Value::from("dtmi:a;1"))]);
        assert_eq!(out, json!({"$metadata": {"$model": "dtmi:a;1"}}));
    }

    #[test]
    fn test_descending_through_leaf_conflicts() {
        let err = flatten(vec![("a", Value::from(1)), ("a.b", Value::from(2))], '.').unwrap_err();
        assert_eq!(err.path, "a");
    }

    #[test]
    fn test_leaf_over_container_conflicts() {
        let err = flatten(vec![("a.b", Value::from(1)), ("a", Value::from(2))], '.').unwrap_err();
        assert_eq!(err.path, "a");
    }

    #[test]
    fn test_duplicate_leaf_conflicts() {
        let err = flatten(vec![("a.b", Value::from(1)), ("a.b", Value::from(2))], '.').unwrap_err();
        assert_eq!(err.path, "a.b");
    }

    #[test]
    fn test_custom_separator() {
        let map = flatten(vec![("a/b", Value::from(1)), ("c.d", Value::from(2))], '/').unwrap();
        assert_eq!(
            serde_json::Value::from(Value::Object(map)),
            json!({"a": {"b": 1}, "c.d": 2})
        );
    }
}
