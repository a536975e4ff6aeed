//! Structural patches over JSON trees.
//!
//! [`diff`] compares two [`Value`]s and returns the forward patches together
//! with their inverse. Applying the forward list to the first value yields
//! the second, and applying the inverse list to the second yields the first.
//!
//! Only three operations exist: add, replace and remove. Arrays are diffed
//! position by position with additions and removals at the tail.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::Result;

/// One step of a path into a JSON tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{}", key.replace('~', "~0").replace('/', "~1")),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

pub type Path = Vec<PathSegment>;

/// Render a path as a JSON pointer.
pub fn pointer(path: &[PathSegment]) -> String {
    path.iter().map(|segment| format!("/{segment}")).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: Path, value: Value },
    Replace { path: Path, value: Value },
    Remove { path: Path },
}

impl PatchOp {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

pub type Patches = Vec<PatchOp>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("no value at `{path}`")]
    PathNotFound { path: String },

    #[error("index {index} is out of bounds at `{path}`")]
    InvalidIndex { path: String, index: usize },

    #[error("value at `{path}` is not an object or array")]
    NotAContainer { path: String },
}

/// Forward and inverse patches turning `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> (Patches, Patches) {
    let mut forward = Patches::new();
    let mut inverse = Patches::new();
    let mut path = Path::new();
    diff_into(&mut path, before, after, &mut forward, &mut inverse);
    inverse.reverse();
    (forward, inverse)
}

fn child(path: &Path, segment: PathSegment) -> Path {
    let mut path = path.clone();
    path.push(segment);
    path
}

fn diff_into(path: &mut Path, before: &Value, after: &Value, forward: &mut Patches, inverse: &mut Patches) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                path.push(PathSegment::Key(key.clone()));
                match new.get(key) {
                    Some(new_value) => diff_into(path, old_value, new_value, forward, inverse),
                    None => {
                        forward.push(PatchOp::Remove { path: path.clone() });
                        inverse.push(PatchOp::Add {
                            path: path.clone(),
                            value: old_value.clone(),
                        });
                    }
                }
                path.pop();
            }
            for (key, new_value) in new {
                if old.contains_key(key) {
                    continue;
                }
                let at = child(path, PathSegment::Key(key.clone()));
                forward.push(PatchOp::Add {
                    path: at.clone(),
                    value: new_value.clone(),
                });
                inverse.push(PatchOp::Remove { path: at });
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for index in 0..common {
                path.push(PathSegment::Index(index));
                diff_into(path, &old[index], &new[index], forward, inverse);
                path.pop();
            }
            for (index, value) in new.iter().enumerate().skip(common) {
                let at = child(path, PathSegment::Index(index));
                forward.push(PatchOp::Add {
                    path: at.clone(),
                    value: value.clone(),
                });
                inverse.push(PatchOp::Remove { path: at });
            }
            for index in (common..old.len()).rev() {
                let at = child(path, PathSegment::Index(index));
                forward.push(PatchOp::Remove { path: at.clone() });
                inverse.push(PatchOp::Add {
                    path: at,
                    value: old[index].clone(),
                });
            }
        }
        _ => {
            forward.push(PatchOp::Replace {
                path: path.clone(),
                value: after.clone(),
            });
            inverse.push(PatchOp::Replace {
                path: path.clone(),
                value: before.clone(),
            });
        }
    }
}

fn parent_mut<'a>(root: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, PatchError> {
    let mut current = root;
    for (depth, segment) in path.iter().enumerate() {
        let next = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key),
            (Value::Array(items), PathSegment::Index(index)) => items.get_mut(*index),
            _ => None,
        };
        current = next.ok_or_else(|| PatchError::PathNotFound {
            path: pointer(&path[..=depth]),
        })?;
    }
    Ok(current)
}

fn apply_one(root: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let path = op.path();
    let Some((last, parent_path)) = path.split_last() else {
        match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => *root = value.clone(),
            PatchOp::Remove { .. } => *root = Value::Null,
        }
        return Ok(());
    };

    let parent = match parent_mut(root, parent_path) {
        Ok(parent) => parent,
        // Removing below a missing parent is already done.
        Err(_) if matches!(op, PatchOp::Remove { .. }) => return Ok(()),
        Err(err) => return Err(err),
    };

    match (parent, last, op) {
        (Value::Object(map), PathSegment::Key(key), PatchOp::Add { value, .. } | PatchOp::Replace { value, .. }) => {
            map.insert(key.clone(), value.clone());
        }
        (Value::Object(map), PathSegment::Key(key), PatchOp::Remove { .. }) => {
            map.remove(key);
        }
        (Value::Array(items), PathSegment::Index(index), PatchOp::Add { value, .. }) => {
            if *index > items.len() {
                return Err(PatchError::InvalidIndex {
                    path: pointer(parent_path),
                    index: *index,
                });
            }
            items.insert(*index, value.clone());
        }
        (Value::Array(items), PathSegment::Index(index), PatchOp::Replace { value, .. }) => {
            let slot = items.get_mut(*index).ok_or(PatchError::InvalidIndex {
                path: pointer(parent_path),
                index: *index,
            })?;
            *slot = value.clone();
        }
        (Value::Array(items), PathSegment::Index(index), PatchOp::Remove { .. }) => {
            if *index < items.len() {
                items.remove(*index);
            }
        }
        (_, _, PatchOp::Remove { .. }) => {}
        _ => {
            return Err(PatchError::NotAContainer {
                path: pointer(parent_path),
            })
        }
    }
    Ok(())
}

/// Apply `patches` in order. Stops at the first failing operation.
pub fn apply(root: &mut Value, patches: &[PatchOp]) -> Result<(), PatchError> {
    for op in patches {
        apply_one(root, op)?;
    }
    Ok(())
}

/// Run `recipe` on a copy of `base` and return the result with the patches
/// describing the change and their inverse.
pub fn produce<D>(base: &D, recipe: impl FnOnce(&mut D)) -> Result<(D, Patches, Patches)>
where
    D: Serialize + DeserializeOwned,
{
    let before = serde_json::to_value(base)?;
    let mut draft: D = serde_json::from_value(before.clone())?;
    recipe(&mut draft);
    let after = serde_json::to_value(&draft)?;
    let (forward, inverse) = diff(&before, &after);
    Ok((draft, forward, inverse))
}
