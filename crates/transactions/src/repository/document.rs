//! Store-backed document repository
//!
//! Staged mutations live in the `txn` extended attribute of the target
//! document itself:
//!
//! ```json
//! {
//!   "id":  { "txn": "<transaction uuid>", "atmpt": "<attempt uuid>" },
//!   "atr": { "id": "<atr doc id>", "coll": "<atr collection>" },
//!   "op":  { "type": "insert|replace|remove", "stgd": <staged body> }
//! }
//! ```
//!
//! Staged inserts exist as tombstones until unstaged; staged replaces and
//! removes leave the committed body visible to plain reads.

use super::{DocState, DocumentRepository, KvSettings, StagedMeta, StagedOpKind};
use async_trait::async_trait;
use coral_store::{
    DocStore, LookupOptions, LookupSpec, MutateOptions, MutateSpec, StoreError, StoreSemantics,
};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct StoreDocumentRepository {
    store: Arc<DocStore>,
    kv: KvSettings,
}

impl StoreDocumentRepository {
    pub fn new(store: Arc<DocStore>, kv: KvSettings) -> Self {
        Self { store, kv }
    }

    fn mutate_options(&self, cas: u64) -> MutateOptions {
        MutateOptions {
            cas,
            durability: self.kv.durability,
            timeout: self.kv.timeout,
            ..Default::default()
        }
    }

    fn lookup_options(&self) -> LookupOptions {
        LookupOptions {
            access_deleted: true,
            timeout: self.kv.timeout,
        }
    }

    fn txn_xattr(meta: &StagedMeta, op: StagedOpKind, staged_body: Option<&Value>) -> Value {
        let mut op_value = json!({ "type": op_type_name(op) });
        if let Some(body) = staged_body {
            op_value["stgd"] = body.clone();
        }
        json!({
            "id": { "txn": meta.transaction_id, "atmpt": meta.attempt_id },
            "atr": { "id": meta.atr_id, "coll": meta.atr_collection },
            "op": op_value,
        })
    }

    async fn stage(
        &self,
        meta: &StagedMeta,
        collection: &str,
        id: &str,
        op: StagedOpKind,
        staged_body: Option<&Value>,
        cas: u64,
        create_as_deleted: bool,
    ) -> Result<u64, StoreError> {
        let specs = [MutateSpec::upsert_xattr(
            "txn",
            Self::txn_xattr(meta, op, staged_body),
        )];
        let options = MutateOptions {
            store_semantics: if create_as_deleted {
                StoreSemantics::Upsert
            } else {
                StoreSemantics::Replace
            },
            create_as_deleted,
            access_deleted: create_as_deleted,
            ..self.mutate_options(cas)
        };
        self.store
            .collection(collection)
            .mutate_in(id, &specs, options)
            .await
    }

    /// Read the staged xattr of a document, tolerating its absence.
    async fn staged_marker(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<(Value, u64, bool)>, StoreError> {
        let result = self
            .store
            .collection(collection)
            .lookup_in(id, &[LookupSpec::get_xattr("txn")], self.lookup_options())
            .await;
        match result {
            Ok(found) => Ok(Some((
                found.values[0].clone().unwrap_or(Value::Null),
                found.cas,
                found.tombstone,
            ))),
            Err(StoreError::DocumentNotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Write the staged body over the committed one and strip the
    /// markers, in one mutation.
    async fn unstage_write(
        &self,
        collection: &str,
        id: &str,
        staged_body: Value,
        cas: u64,
    ) -> Result<(), StoreError> {
        let specs = [
            MutateSpec::set_doc(staged_body),
            MutateSpec::remove_xattr("txn"),
        ];
        let options = MutateOptions {
            access_deleted: true,
            ..self.mutate_options(cas)
        };
        self.store
            .collection(collection)
            .mutate_in(id, &specs, options)
            .await?;
        Ok(())
    }

    async fn strip_markers(&self, collection: &str, id: &str, cas: u64) -> Result<(), StoreError> {
        let specs = [MutateSpec::remove_xattr("txn")];
        let options = MutateOptions {
            access_deleted: true,
            ..self.mutate_options(cas)
        };
        self.store
            .collection(collection)
            .mutate_in(id, &specs, options)
            .await?;
        Ok(())
    }

    /// Cleanup-side resolution of one staged document: look up the
    /// current markers, skip when another attempt owns them or they are
    /// gone, then commit or roll back under the observed CAS.
    async fn resolve_staged_doc(
        &self,
        collection: &str,
        id: &str,
        attempt_id: &str,
        commit: bool,
    ) -> Result<(), StoreError> {
        let Some((marker, cas, tombstone)) = self.staged_marker(collection, id).await? else {
            return Ok(());
        };
        if marker["id"]["atmpt"].as_str() != Some(attempt_id) {
            return Ok(()); // someone else's staging, or already resolved
        }
        let op = marker["op"]["type"].as_str().unwrap_or_default().to_string();
        let staged_body = marker["op"]["stgd"].clone();

        let outcome = if commit {
            match op.as_str() {
                "insert" | "replace" => self.unstage_write(collection, id, staged_body, cas).await,
                "remove" => self.unstage_remove(collection, id, cas).await,
                _ => Ok(()),
            }
        } else {
            match op.as_str() {
                "insert" if tombstone => self.rollback_staged_insert(collection, id, cas).await,
                _ => self.rollback_staged_write(collection, id, cas).await,
            }
        };
        match outcome {
            // A concurrent cleaner or the owning client got there first.
            Err(
                StoreError::CasMismatch(_)
                | StoreError::DocumentNotFound(_)
                | StoreError::PathNotFound(_),
            ) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl DocumentRepository for StoreDocumentRepository {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<(Value, u64)>, StoreError> {
        match self.store.collection(collection).get(id).await {
            Ok(found) => Ok(Some(found)),
            Err(StoreError::DocumentNotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn staging_state(&self, collection: &str, id: &str) -> Result<DocState, StoreError> {
        match self.staged_marker(collection, id).await? {
            Some((marker, cas, tombstone)) => Ok(DocState {
                cas,
                exists: true,
                live: !tombstone,
                staged_by: marker["id"]["txn"].as_str().map(str::to_string),
            }),
            None => Ok(DocState::default()),
        }
    }

    async fn staged_insert(
        &self,
        meta: &StagedMeta,
        collection: &str,
        id: &str,
        body: &Value,
        cas: u64,
    ) -> Result<u64, StoreError> {
        self.stage(
            meta,
            collection,
            id,
            StagedOpKind::Insert,
            Some(body),
            cas,
            true,
        )
        .await
    }

    async fn staged_replace(
        &self,
        meta: &StagedMeta,
        collection: &str,
        id: &str,
        body: &Value,
        cas: u64,
    ) -> Result<u64, StoreError> {
        self.stage(
            meta,
            collection,
            id,
            StagedOpKind::Replace,
            Some(body),
            cas,
            false,
        )
        .await
    }

    async fn staged_remove(
        &self,
        meta: &StagedMeta,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<u64, StoreError> {
        self.stage(meta, collection, id, StagedOpKind::Remove, None, cas, false)
            .await
    }

    async fn unstage_insert(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError> {
        let Some((marker, _, _)) = self.staged_marker(collection, id).await? else {
            return Err(StoreError::DocumentNotFound(id.to_string()));
        };
        self.unstage_write(collection, id, marker["op"]["stgd"].clone(), cas)
            .await
    }

    async fn unstage_replace(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError> {
        self.unstage_insert(collection, id, cas).await
    }

    async fn unstage_remove(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError> {
        self.store.collection(collection).remove(id, cas).await
    }

    async fn rollback_staged_insert(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError> {
        // The staged tombstone stays behind as a bare tombstone, which is
        // invisible to reads and reusable by later inserts.
        self.strip_markers(collection, id, cas).await
    }

    async fn rollback_staged_write(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError> {
        self.strip_markers(collection, id, cas).await
    }

    async fn commit_staged_doc(
        &self,
        collection: &str,
        id: &str,
        attempt_id: &str,
    ) -> Result<(), StoreError> {
        self.resolve_staged_doc(collection, id, attempt_id, true)
            .await
    }

    async fn rollback_staged_doc(
        &self,
        collection: &str,
        id: &str,
        attempt_id: &str,
    ) -> Result<(), StoreError> {
        self.resolve_staged_doc(collection, id, attempt_id, false)
            .await
    }

    async fn query(&self, _statement: &str) -> Result<Vec<Value>, StoreError> {
        Err(StoreError::InvalidArgument(
            "query service is not available on this store".to_string(),
        ))
    }
}

fn op_type_name(op: StagedOpKind) -> &'static str {
    match op {
        StagedOpKind::Insert => "insert",
        StagedOpKind::Replace => "replace",
        StagedOpKind::Remove => "remove",
    }
}
