//! JSON Patch (RFC 6902) documents and their application to stored objects.
//!
//! The reconciler only ever emits `add` operations, addressed at the deepest
//! path the stored object already has; `replace` and `remove` are understood
//! so that stores can apply patches produced elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::model::{is_reserved, PropertyMap};

use super::{StoreError, StoreResult};

/// One patch operation. `path` is an RFC 6901 JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Json },
    Replace { path: String, value: Json },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

/// An ordered list of patch operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPatch(Vec<PatchOp>);

impl JsonPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an `add` of a top-level member.
    pub fn add(mut self, key: &str, value: impl Into<Json>) -> Self {
        self.0.push(PatchOp::Add { path: format!("/{}", escape_token(key)), value: value.into() });
        self
    }

    /// Patch that writes the non-reserved `properties` into `current`
    /// without touching anything else it holds.
    ///
    /// Where both sides hold an object at the same path the patch descends
    /// into it, so sibling members written by other imports survive. Any
    /// other value, including a whole subtree whose parent `current` lacks,
    /// is added at the deepest path that already exists.
    pub fn merge(current: &Map<String, Json>, properties: &PropertyMap) -> Self {
        let mut patch = Self::new();
        for (key, value) in properties.iter().filter(|(k, _)| !is_reserved(k)) {
            let value = Json::from(value.clone());
            patch.merge_member(current.get(key), &mut vec![key.as_str()], &value);
        }
        patch
    }

    fn merge_member<'a>(&mut self, stored: Option<&Json>, path: &mut Vec<&'a str>, value: &'a Json) {
        if let (Some(Json::Object(stored)), Json::Object(incoming)) = (stored, value) {
            for (key, value) in incoming {
                path.push(key);
                self.merge_member(stored.get(key), path, value);
                path.pop();
            }
            return;
        }
        self.0.push(PatchOp::Add { path: pointer(path), value: value.clone() });
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply every operation in order. On error the target may be partially
    /// patched.
    pub fn apply(&self, target: &mut Map<String, Json>) -> StoreResult<()> {
        for op in &self.0 {
            apply_op(target, op)?;
        }
        Ok(())
    }
}

/// Escape a key for use as a pointer reference token: `~` → `~0`, `/` → `~1`.
pub fn escape_token(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn pointer(tokens: &[&str]) -> String {
    tokens.iter().map(|t| format!("/{}", escape_token(t))).collect()
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn split_pointer(path: &str) -> StoreResult<(Vec<String>, String)> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(StoreError::InvalidPatch(format!("pointer must start with '/': {path:?}")));
    };
    let mut tokens: Vec<String> = rest.split('/').map(unescape_token).collect();
    let last = tokens.pop().unwrap_or_default();
    Ok((tokens, last))
}

fn parent_mut<'a>(root: &'a mut Map<String, Json>, parents: &[String], path: &str) -> StoreResult<&'a mut Json> {
    let missing = || StoreError::InvalidPatch(format!("parent of {path:?} does not exist"));
    let (first, rest) = match parents.split_first() {
        Some(split) => split,
        None => return Err(missing()),
    };
    let mut node = root.get_mut(first).ok_or_else(missing)?;
    for token in rest {
        node = match node {
            Json::Object(map) => map.get_mut(token).ok_or_else(missing)?,
            Json::Array(items) => {
                let index: usize = token.parse().map_err(|_| missing())?;
                items.get_mut(index).ok_or_else(missing)?
            }
            _ => return Err(missing()),
        };
    }
    Ok(node)
}

fn apply_op(root: &mut Map<String, Json>, op: &PatchOp) -> StoreResult<()> {
    let path = op.path();
    let (parents, last) = split_pointer(path)?;

    if parents.is_empty() {
        return apply_to_object(root, &last, op, path);
    }
    match parent_mut(root, &parents, path)? {
        Json::Object(map) => apply_to_object(map, &last, op, path),
        Json::Array(items) => apply_to_array(items, &last, op, path),
        _ => Err(StoreError::InvalidPatch(format!("parent of {path:?} is not a container"))),
    }
}

fn apply_to_object(map: &mut Map<String, Json>, key: &str, op: &PatchOp, path: &str) -> StoreResult<()> {
    match op {
        PatchOp::Add { value, .. } => {
            map.insert(key.to_owned(), value.clone());
        }
        PatchOp::Replace { value, .. } => match map.get_mut(key) {
            Some(slot) => *slot = value.clone(),
            None => return Err(StoreError::InvalidPatch(format!("{path:?} does not exist"))),
        },
        PatchOp::Remove { .. } => {
            if map.remove(key).is_none() {
                return Err(StoreError::InvalidPatch(format!("{path:?} does not exist")));
            }
        }
    }
    Ok(())
}

fn apply_to_array(items: &mut Vec<Json>, token: &str, op: &PatchOp, path: &str) -> StoreResult<()> {
    let out_of_range = || StoreError::InvalidPatch(format!("{path:?} is out of range"));
    match op {
        PatchOp::Add { value, .. } if token == "-" => items.push(value.clone()),
        PatchOp::Add { value, .. } => {
            let index: usize = token.parse().map_err(|_| out_of_range())?;
            if index > items.len() {
                return Err(out_of_range());
            }
            items.insert(index, value.clone());
        }
        PatchOp::Replace { value, .. } => {
            let index: usize = token.parse().map_err(|_| out_of_range())?;
            *items.get_mut(index).ok_or_else(out_of_range)? = value.clone();
        }
        PatchOp::Remove { .. } => {
            let index: usize = token.parse().map_err(|_| out_of_range())?;
            if index >= items.len() {
                return Err(out_of_range());
            }
            items.remove(index);
        }
    }
    Ok(())
}
