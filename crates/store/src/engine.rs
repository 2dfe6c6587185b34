//! In-process document store engine

use crate::client::Collection;
use crate::document::Document;
use crate::error::{Result, StoreError};
use crate::faults::{self, Fault, FiredFault, StoreOp};
use crate::subdoc::{
    self, LookupOptions, LookupResult, LookupSpec, MutateOptions, MutateSpec, StoreSemantics,
    MAX_SPECS, MUTATION_CAS_MACRO, VBUCKET_HLC_PATH,
};
use coral_hlc::{format_mutation_cas, HlcClock};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// The store engine: named collections of documents, a CAS-minting HLC
/// clock, and the fault plan.
///
/// All access goes through [`Collection`] handles obtained from
/// [`DocStore::collection`].
pub struct DocStore {
    collections: Mutex<HashMap<String, HashMap<String, Document>>>,
    clock: HlcClock,
    faults: Mutex<Vec<Fault>>,
}

impl DocStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            clock: HlcClock::new(),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Obtain a handle to a collection, creating it lazily on first write.
    pub fn collection(self: &Arc<Self>, name: impl Into<String>) -> Collection {
        Collection::new(name.into(), self.clone())
    }

    /// Queue a fault for a future matching operation.
    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    /// Current server HLC reading in milliseconds, as `$vbucket.HLC`
    /// reports it.
    pub fn hlc_now_ms(&self) -> u64 {
        self.clock.now().as_millis()
    }

    fn fire_fault(&self, op: StoreOp, id: &str) -> Option<FiredFault> {
        faults::fire(&mut self.faults.lock(), op, id)
    }

    pub(crate) fn get(&self, collection: &str, id: &str) -> Result<(Value, u64)> {
        if let Some(fault) = self.fire_fault(StoreOp::Get, id) {
            return Err(fault.error);
        }
        let collections = self.collections.lock();
        let doc = live_doc(&collections, collection, id)?;
        Ok((doc.body.clone().unwrap_or(Value::Null), doc.cas))
    }

    pub(crate) fn insert(&self, collection: &str, id: &str, body: Value) -> Result<u64> {
        if let Some(fault) = self.fire_fault(StoreOp::Insert, id) {
            return Err(fault.error);
        }
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.get(id).is_some_and(|d| !d.is_tombstone()) {
            return Err(StoreError::DocumentExists(id.to_string()));
        }
        let cas = self.clock.now_cas();
        docs.insert(
            id.to_string(),
            Document {
                body: Some(body),
                xattrs: Map::new(),
                cas,
            },
        );
        Ok(cas)
    }

    pub(crate) fn upsert(&self, collection: &str, id: &str, body: Value) -> Result<u64> {
        if let Some(fault) = self.fire_fault(StoreOp::Upsert, id) {
            return Err(fault.error);
        }
        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();
        let cas = self.clock.now_cas();
        let doc = docs.entry(id.to_string()).or_default();
        doc.body = Some(body);
        doc.cas = cas;
        Ok(cas)
    }

    pub(crate) fn replace(&self, collection: &str, id: &str, body: Value, cas: u64) -> Result<u64> {
        if let Some(fault) = self.fire_fault(StoreOp::Replace, id) {
            return Err(fault.error);
        }
        let mut collections = self.collections.lock();
        let doc = live_doc_mut(&mut collections, collection, id)?;
        check_cas(doc, id, cas)?;
        let new_cas = self.clock.now_cas();
        doc.body = Some(body);
        doc.cas = new_cas;
        Ok(new_cas)
    }

    pub(crate) fn remove(&self, collection: &str, id: &str, cas: u64) -> Result<()> {
        if let Some(fault) = self.fire_fault(StoreOp::Remove, id) {
            return Err(fault.error);
        }
        let mut collections = self.collections.lock();
        let doc = live_doc_mut(&mut collections, collection, id)?;
        check_cas(doc, id, cas)?;
        collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id));
        Ok(())
    }

    pub(crate) fn lookup_in(
        &self,
        collection: &str,
        id: &str,
        specs: &[LookupSpec],
        options: &LookupOptions,
    ) -> Result<LookupResult> {
        if specs.len() > MAX_SPECS {
            return Err(StoreError::TooManySpecs(specs.len()));
        }
        if let Some(fault) = self.fire_fault(StoreOp::LookupIn, id) {
            return Err(fault.error);
        }
        let collections = self.collections.lock();
        let doc = collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        if doc.is_tombstone() && !options.access_deleted {
            return Err(StoreError::DocumentNotFound(id.to_string()));
        }

        let xattr_root = Value::Object(doc.xattrs.clone());
        let body = doc.body.clone().unwrap_or(Value::Null);
        let values = specs
            .iter()
            .map(|spec| {
                let LookupSpec::Get { path, xattr } = spec;
                if path == VBUCKET_HLC_PATH {
                    Some(json!({ "now_ms": self.clock.now().as_millis().to_string() }))
                } else if *xattr {
                    subdoc::path_get(&xattr_root, path).cloned()
                } else {
                    subdoc::path_get(&body, path).cloned()
                }
            })
            .collect();

        Ok(LookupResult {
            cas: doc.cas,
            values,
            tombstone: doc.is_tombstone(),
        })
    }

    pub(crate) fn mutate_in(
        &self,
        collection: &str,
        id: &str,
        specs: &[MutateSpec],
        options: &MutateOptions,
    ) -> Result<u64> {
        if specs.len() > MAX_SPECS {
            return Err(StoreError::TooManySpecs(specs.len()));
        }
        let fault = self.fire_fault(StoreOp::MutateIn, id);
        if let Some(fired) = &fault {
            if !fired.applied {
                return Err(fired.error.clone());
            }
        }

        let mut collections = self.collections.lock();
        let docs = collections.entry(collection.to_string()).or_default();

        let mut doc = match docs.get(id) {
            Some(existing) if !existing.is_tombstone() => {
                if options.store_semantics == StoreSemantics::Insert {
                    return Err(StoreError::DocumentExists(id.to_string()));
                }
                existing.clone()
            }
            Some(tombstone) => {
                if !options.access_deleted && !options.create_as_deleted {
                    return Err(StoreError::DocumentNotFound(id.to_string()));
                }
                tombstone.clone()
            }
            None => match options.store_semantics {
                StoreSemantics::Replace => {
                    return Err(StoreError::DocumentNotFound(id.to_string()))
                }
                StoreSemantics::Upsert | StoreSemantics::Insert => Document {
                    body: (!options.create_as_deleted).then_some(Value::Null),
                    xattrs: Map::new(),
                    cas: 0,
                },
            },
        };

        check_cas(&doc, id, options.cas)?;
        let new_cas = self.clock.now_cas();

        // Specs apply to a working copy so a failing spec leaves the
        // document untouched.
        for spec in specs {
            apply_spec(&mut doc, spec, new_cas)?;
        }
        doc.cas = new_cas;
        docs.insert(id.to_string(), doc);

        match fault {
            Some(fired) => Err(fired.error),
            None => Ok(new_cas),
        }
    }
}

impl Default for DocStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_spec(doc: &mut Document, spec: &MutateSpec, new_cas: u64) -> Result<()> {
    match spec {
        MutateSpec::Upsert {
            path,
            value,
            xattr,
            expand_macros,
        } => {
            let value = if *expand_macros {
                expand_macro(value, new_cas)
            } else {
                value.clone()
            };
            if *xattr {
                subdoc::path_upsert(&mut doc.xattrs, path, value)
            } else {
                body_object(doc, path).and_then(|body| subdoc::path_upsert(body, path, value))
            }
        }
        MutateSpec::Insert { path, value, xattr } => {
            if *xattr {
                subdoc::path_insert(&mut doc.xattrs, path, value.clone())
            } else {
                body_object(doc, path)
                    .and_then(|body| subdoc::path_insert(body, path, value.clone()))
            }
        }
        MutateSpec::Remove { path, xattr } => {
            if *xattr {
                subdoc::path_remove(&mut doc.xattrs, path)
            } else {
                body_object(doc, path).and_then(|body| subdoc::path_remove(body, path))
            }
        }
        MutateSpec::ArrayAppend { path, value, xattr } => {
            if *xattr {
                subdoc::path_array_append(&mut doc.xattrs, path, value.clone())
            } else {
                body_object(doc, path)
                    .and_then(|body| subdoc::path_array_append(body, path, value.clone()))
            }
        }
        MutateSpec::SetDoc { value } => {
            doc.body = Some(value.clone());
            Ok(())
        }
    }
}

fn expand_macro(value: &Value, new_cas: u64) -> Value {
    match value.as_str() {
        Some(MUTATION_CAS_MACRO) => Value::String(format_mutation_cas(new_cas)),
        _ => value.clone(),
    }
}

/// Body as a mutable object map for body-path specs.
fn body_object<'a>(doc: &'a mut Document, path: &str) -> Result<&'a mut Map<String, Value>> {
    match doc.body {
        Some(Value::Object(ref mut map)) => Ok(map),
        _ => Err(StoreError::PathNotFound(path.to_string())),
    }
}

fn check_cas(doc: &Document, id: &str, expected: u64) -> Result<()> {
    if expected != 0 && doc.cas != expected {
        return Err(StoreError::CasMismatch(id.to_string()));
    }
    Ok(())
}

fn live_doc<'a>(
    collections: &'a HashMap<String, HashMap<String, Document>>,
    collection: &str,
    id: &str,
) -> Result<&'a Document> {
    collections
        .get(collection)
        .and_then(|docs| docs.get(id))
        .filter(|doc| !doc.is_tombstone())
        .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))
}

fn live_doc_mut<'a>(
    collections: &'a mut HashMap<String, HashMap<String, Document>>,
    collection: &str,
    id: &str,
) -> Result<&'a mut Document> {
    collections
        .get_mut(collection)
        .and_then(|docs| docs.get_mut(id))
        .filter(|doc| !doc.is_tombstone())
        .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))
}
