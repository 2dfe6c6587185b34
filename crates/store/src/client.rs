//! Collection handle that follows the production collection API
//!
//! A thin async facade over the engine so callers read like they are
//! talking to the real cluster.

use crate::engine::DocStore;
use crate::error::Result;
use crate::subdoc::{LookupOptions, LookupResult, LookupSpec, MutateOptions, MutateSpec};
use serde_json::Value;
use std::sync::Arc;

/// Handle to one collection of the store.
#[derive(Clone)]
pub struct Collection {
    name: String,
    store: Arc<DocStore>,
}

impl Collection {
    pub(crate) fn new(name: String, store: Arc<DocStore>) -> Self {
        Self { name, store }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine backing this collection.
    pub fn store(&self) -> &Arc<DocStore> {
        &self.store
    }

    /// Fetch a document's body and CAS.
    pub async fn get(&self, id: &str) -> Result<(Value, u64)> {
        self.store.get(&self.name, id)
    }

    /// Create a document, failing if it already exists.
    pub async fn insert(&self, id: &str, body: Value) -> Result<u64> {
        self.store.insert(&self.name, id, body)
    }

    /// Create or overwrite a document.
    pub async fn upsert(&self, id: &str, body: Value) -> Result<u64> {
        self.store.upsert(&self.name, id, body)
    }

    /// Replace a document's body; `cas == 0` skips the check.
    pub async fn replace(&self, id: &str, body: Value, cas: u64) -> Result<u64> {
        self.store.replace(&self.name, id, body, cas)
    }

    /// Delete a document; `cas == 0` skips the check.
    pub async fn remove(&self, id: &str, cas: u64) -> Result<()> {
        self.store.remove(&self.name, id, cas)
    }

    /// Read up to 16 paths from a document in one call.
    pub async fn lookup_in(
        &self,
        id: &str,
        specs: &[LookupSpec],
        options: LookupOptions,
    ) -> Result<LookupResult> {
        self.store.lookup_in(&self.name, id, specs, &options)
    }

    /// Apply up to 16 path mutations to a document atomically.
    pub async fn mutate_in(
        &self,
        id: &str,
        specs: &[MutateSpec],
        options: MutateOptions,
    ) -> Result<u64> {
        self.store.mutate_in(&self.name, id, specs, &options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::subdoc::{StoreSemantics, MAX_SPECS, VBUCKET_HLC_PATH};
    use serde_json::json;

    fn collection() -> Collection {
        Arc::new(DocStore::new()).collection("test")
    }

    #[tokio::test]
    async fn test_kv_roundtrip() {
        let coll = collection();
        let cas = coll.insert("a", json!({"v": 1})).await.unwrap();
        assert!(cas > 0);

        let (body, read_cas) = coll.get("a").await.unwrap();
        assert_eq!(body, json!({"v": 1}));
        assert_eq!(read_cas, cas);

        let new_cas = coll.replace("a", json!({"v": 2}), cas).await.unwrap();
        assert!(new_cas > cas);

        assert_eq!(
            coll.replace("a", json!({"v": 3}), cas).await,
            Err(StoreError::CasMismatch("a".to_string()))
        );

        coll.remove("a", new_cas).await.unwrap();
        assert_eq!(
            coll.get("a").await,
            Err(StoreError::DocumentNotFound("a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_insert_rejects_existing() {
        let coll = collection();
        coll.insert("a", json!(1)).await.unwrap();
        assert_eq!(
            coll.insert("a", json!(2)).await,
            Err(StoreError::DocumentExists("a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_xattrs_survive_replace_and_hide_from_get() {
        let coll = collection();
        let cas = coll.insert("a", json!({"v": 1})).await.unwrap();
        coll.mutate_in(
            "a",
            &[MutateSpec::upsert_xattr("meta.owner", json!("x"))],
            MutateOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(coll.get("a").await.unwrap().0, json!({"v": 1}));

        coll.replace("a", json!({"v": 2}), 0).await.unwrap();
        let result = coll
            .lookup_in(
                "a",
                &[LookupSpec::get_xattr("meta.owner")],
                LookupOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.values[0], Some(json!("x")));
        assert!(result.cas > cas);
    }

    #[tokio::test]
    async fn test_tombstone_semantics() {
        let coll = collection();
        coll.mutate_in(
            "ghost",
            &[MutateSpec::upsert_xattr("txn.id", json!("t1"))],
            MutateOptions {
                store_semantics: StoreSemantics::Insert,
                create_as_deleted: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Invisible to plain reads
        assert_eq!(
            coll.get("ghost").await,
            Err(StoreError::DocumentNotFound("ghost".to_string()))
        );
        assert_eq!(
            coll.lookup_in(
                "ghost",
                &[LookupSpec::get_xattr("txn.id")],
                LookupOptions::default()
            )
            .await,
            Err(StoreError::DocumentNotFound("ghost".to_string()))
        );

        // Visible with access_deleted
        let result = coll
            .lookup_in(
                "ghost",
                &[LookupSpec::get_xattr("txn.id")],
                LookupOptions {
                    access_deleted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(result.tombstone);
        assert_eq!(result.values[0], Some(json!("t1")));

        // SetDoc revives it
        coll.mutate_in(
            "ghost",
            &[
                MutateSpec::set_doc(json!({"v": 1})),
                MutateSpec::remove_xattr("txn"),
            ],
            MutateOptions {
                access_deleted: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(coll.get("ghost").await.unwrap().0, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_spec_cap() {
        let coll = collection();
        coll.insert("a", json!({})).await.unwrap();
        let specs: Vec<MutateSpec> = (0..MAX_SPECS + 1)
            .map(|i| MutateSpec::upsert_xattr(format!("k{i}"), json!(i)))
            .collect();
        assert_eq!(
            coll.mutate_in("a", &specs, MutateOptions::default()).await,
            Err(StoreError::TooManySpecs(MAX_SPECS + 1))
        );
    }

    #[tokio::test]
    async fn test_mutation_cas_macro_expansion() {
        let coll = collection();
        coll.insert("a", json!({})).await.unwrap();
        let cas = coll
            .mutate_in(
                "a",
                &[MutateSpec::upsert_xattr_macro("meta.stamp")],
                MutateOptions::default(),
            )
            .await
            .unwrap();

        let result = coll
            .lookup_in(
                "a",
                &[LookupSpec::get_xattr("meta.stamp")],
                LookupOptions::default(),
            )
            .await
            .unwrap();
        let stamp = result.values[0].as_ref().unwrap().as_str().unwrap();
        assert_eq!(
            coral_hlc::parse_mutation_cas(stamp).unwrap().as_nanos(),
            cas
        );
    }

    #[tokio::test]
    async fn test_vbucket_hlc_lookup() {
        let coll = collection();
        coll.insert("a", json!({})).await.unwrap();
        let result = coll
            .lookup_in(
                "a",
                &[LookupSpec::get_xattr(VBUCKET_HLC_PATH)],
                LookupOptions::default(),
            )
            .await
            .unwrap();
        let now_ms: u64 = result.values[0].as_ref().unwrap()["now_ms"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(now_ms > 1_000_000_000_000); // past 2001 in ms
    }

    #[tokio::test]
    async fn test_failing_spec_leaves_document_untouched() {
        let coll = collection();
        coll.insert("a", json!({})).await.unwrap();
        let err = coll
            .mutate_in(
                "a",
                &[
                    MutateSpec::upsert_xattr("meta.a", json!(1)),
                    MutateSpec::remove_xattr("missing.path"),
                ],
                MutateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PathNotFound(_)));

        let result = coll
            .lookup_in(
                "a",
                &[LookupSpec::get_xattr("meta.a")],
                LookupOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.values[0], None);
    }
}
