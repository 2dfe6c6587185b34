//! Subdocument specs, options and path handling

use crate::error::{Result, StoreError};
use serde_json::{Map, Value};
use std::time::Duration;

/// Maximum subdocument specs accepted in a single call.
pub const MAX_SPECS: usize = 16;

/// Macro expanded server-side into the mutation's CAS string.
pub const MUTATION_CAS_MACRO: &str = "${Mutation.CAS}";

/// Virtual xattr path returning the vbucket's current HLC reading.
pub const VBUCKET_HLC_PATH: &str = "$vbucket.HLC";

/// Durability required of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityLevel {
    #[default]
    None,
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

/// One path read within a `lookup_in` call.
#[derive(Debug, Clone)]
pub enum LookupSpec {
    Get { path: String, xattr: bool },
}

impl LookupSpec {
    /// Read a body path.
    pub fn get(path: impl Into<String>) -> Self {
        Self::Get {
            path: path.into(),
            xattr: false,
        }
    }

    /// Read an extended attribute path.
    pub fn get_xattr(path: impl Into<String>) -> Self {
        Self::Get {
            path: path.into(),
            xattr: true,
        }
    }
}

/// One mutation within a `mutate_in` call.
#[derive(Debug, Clone)]
pub enum MutateSpec {
    /// Create or overwrite a path, creating intermediates.
    Upsert {
        path: String,
        value: Value,
        xattr: bool,
        expand_macros: bool,
    },
    /// Create a path, failing if it exists.
    Insert {
        path: String,
        value: Value,
        xattr: bool,
    },
    /// Remove a path, failing if it does not exist.
    Remove { path: String, xattr: bool },
    /// Append to an array at a path, creating it if missing.
    ArrayAppend {
        path: String,
        value: Value,
        xattr: bool,
    },
    /// Replace the whole document body (revives a tombstone).
    SetDoc { value: Value },
}

impl MutateSpec {
    pub fn upsert_xattr(path: impl Into<String>, value: Value) -> Self {
        Self::Upsert {
            path: path.into(),
            value,
            xattr: true,
            expand_macros: false,
        }
    }

    /// Upsert an xattr whose value is the mutation-CAS macro.
    pub fn upsert_xattr_macro(path: impl Into<String>) -> Self {
        Self::Upsert {
            path: path.into(),
            value: Value::String(MUTATION_CAS_MACRO.to_string()),
            xattr: true,
            expand_macros: true,
        }
    }

    pub fn insert_xattr(path: impl Into<String>, value: Value) -> Self {
        Self::Insert {
            path: path.into(),
            value,
            xattr: true,
        }
    }

    pub fn remove_xattr(path: impl Into<String>) -> Self {
        Self::Remove {
            path: path.into(),
            xattr: true,
        }
    }

    pub fn array_append_xattr(path: impl Into<String>, value: Value) -> Self {
        Self::ArrayAppend {
            path: path.into(),
            value,
            xattr: true,
        }
    }

    pub fn set_doc(value: Value) -> Self {
        Self::SetDoc { value }
    }
}

/// Document-level semantics of a `mutate_in` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    /// Mutate an existing document.
    #[default]
    Replace,
    /// Create the document if missing.
    Upsert,
    /// Create the document, failing if it exists.
    Insert,
}

/// Options for `mutate_in`.
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
    /// Expected CAS; `0` skips the check.
    pub cas: u64,
    pub store_semantics: StoreSemantics,
    /// Create the document as a tombstone.
    pub create_as_deleted: bool,
    /// Allow mutating a tombstone.
    pub access_deleted: bool,
    pub durability: DurabilityLevel,
    pub timeout: Option<Duration>,
}

/// Options for `lookup_in`.
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// Allow reading a tombstone's xattrs.
    pub access_deleted: bool,
    pub timeout: Option<Duration>,
}

/// Result of a `lookup_in` call; one value per spec, `None` when the path
/// was absent.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub cas: u64,
    pub values: Vec<Option<Value>>,
    pub tombstone: bool,
}

/// Walk a dotted path through nested objects.
pub(crate) fn path_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Create or overwrite the value at a dotted path, creating intermediate
/// objects.
pub(crate) fn path_upsert(root: &mut Map<String, Value>, path: &str, value: Value) -> Result<()> {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| StoreError::PathNotFound(path.to_string()))?;
    }
    Err(StoreError::PathNotFound(path.to_string()))
}

/// Create the value at a dotted path, failing if the leaf already exists.
pub(crate) fn path_insert(root: &mut Map<String, Value>, path: &str, value: Value) -> Result<()> {
    if let Some(parent) = parent_of(root, path)? {
        let leaf = leaf_segment(path);
        if parent.contains_key(leaf) {
            return Err(StoreError::PathExists(path.to_string()));
        }
    }
    path_upsert(root, path, value)
}

/// Remove the value at a dotted path.
pub(crate) fn path_remove(root: &mut Map<String, Value>, path: &str) -> Result<()> {
    match parent_of(root, path)? {
        Some(parent) => parent
            .remove(leaf_segment(path))
            .map(|_| ())
            .ok_or_else(|| StoreError::PathNotFound(path.to_string())),
        None => Err(StoreError::PathNotFound(path.to_string())),
    }
}

/// Append to the array at a dotted path, creating it if absent.
pub(crate) fn path_array_append(
    root: &mut Map<String, Value>,
    path: &str,
    value: Value,
) -> Result<()> {
    if let Some(parent) = parent_of(root, path)? {
        if let Some(existing) = parent.get_mut(leaf_segment(path)) {
            return match existing.as_array_mut() {
                Some(array) => {
                    array.push(value);
                    Ok(())
                }
                None => Err(StoreError::PathNotFound(path.to_string())),
            };
        }
    }
    path_upsert(root, path, Value::Array(vec![value]))
}

fn leaf_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Parent object of the path's leaf, or `None` when an intermediate is
/// missing (the caller creates it via upsert).
fn parent_of<'a>(
    root: &'a mut Map<String, Value>,
    path: &str,
) -> Result<Option<&'a mut Map<String, Value>>> {
    let mut current = root;
    let mut segments: Vec<&str> = path.split('.').collect();
    segments.pop();
    for segment in segments {
        match current.get_mut(segment) {
            Some(next) => {
                current = next
                    .as_object_mut()
                    .ok_or_else(|| StoreError::PathNotFound(path.to_string()))?;
            }
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}
