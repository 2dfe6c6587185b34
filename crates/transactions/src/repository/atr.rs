//! Store-backed ATR repository
//!
//! ATR documents are named `_txn:atr-<i>` and live in the metadata
//! collection. Each holds an `attempts` extended attribute mapping
//! attempt ids to their entries; the documents themselves are created
//! lazily by the first entry.

use super::{AtrEntry, AtrRepository, AtrState, DocRecord, KvSettings, StagedOpKind};
use async_trait::async_trait;
use coral_store::{
    DocStore, LookupOptions, LookupSpec, MutateOptions, MutateSpec, StoreError, StoreSemantics,
    VBUCKET_HLC_PATH,
};
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Name of the ATR document at an index.
pub fn atr_id_for_index(index: usize) -> String {
    format!("_txn:atr-{index}")
}

/// ATR index for the first mutated key of an attempt. The salt bumps the
/// choice onto a different ATR after a full one was hit.
pub(crate) fn atr_index_for_key(key: &str, salt: u64, num_atrs: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    salt.hash(&mut hasher);
    (hasher.finish() % num_atrs.max(1) as u64) as usize
}

pub struct StoreAtrRepository {
    store: Arc<DocStore>,
    collection: String,
    kv: KvSettings,
}

impl StoreAtrRepository {
    pub fn new(store: Arc<DocStore>, collection: impl Into<String>, kv: KvSettings) -> Self {
        Self {
            store,
            collection: collection.into(),
            kv,
        }
    }

    fn mutate_options(&self, store_semantics: StoreSemantics) -> MutateOptions {
        MutateOptions {
            store_semantics,
            durability: self.kv.durability,
            timeout: self.kv.timeout,
            ..Default::default()
        }
    }
}

#[async_trait]
impl AtrRepository for StoreAtrRepository {
    async fn create_atr_entry(
        &self,
        atr_id: &str,
        attempt_id: &str,
        transaction_id: &str,
        expires_ms: u64,
    ) -> Result<(), StoreError> {
        let entry = format!("attempts.{attempt_id}");
        let specs = [
            MutateSpec::upsert_xattr(format!("{entry}.tid"), json!(transaction_id)),
            MutateSpec::upsert_xattr(format!("{entry}.st"), json!(AtrState::Pending)),
            MutateSpec::upsert_xattr_macro(format!("{entry}.tst")),
            MutateSpec::upsert_xattr(format!("{entry}.exp"), json!(expires_ms)),
        ];
        self.store
            .collection(&self.collection)
            .mutate_in(atr_id, &specs, self.mutate_options(StoreSemantics::Upsert))
            .await?;
        Ok(())
    }

    async fn set_atr_state(
        &self,
        atr_id: &str,
        attempt_id: &str,
        state: AtrState,
    ) -> Result<(), StoreError> {
        let specs = [MutateSpec::upsert_xattr(
            format!("attempts.{attempt_id}.st"),
            json!(state),
        )];
        self.store
            .collection(&self.collection)
            .mutate_in(atr_id, &specs, self.mutate_options(StoreSemantics::Replace))
            .await?;
        Ok(())
    }

    async fn append_doc_record(
        &self,
        atr_id: &str,
        attempt_id: &str,
        op: StagedOpKind,
        doc: &DocRecord,
    ) -> Result<(), StoreError> {
        let list = match op {
            StagedOpKind::Insert => "ins",
            StagedOpKind::Replace => "rep",
            StagedOpKind::Remove => "rem",
        };
        let specs = [MutateSpec::array_append_xattr(
            format!("attempts.{attempt_id}.{list}"),
            serde_json::to_value(doc).expect("doc record serializes"),
        )];
        self.store
            .collection(&self.collection)
            .mutate_in(atr_id, &specs, self.mutate_options(StoreSemantics::Replace))
            .await?;
        Ok(())
    }

    async fn lookup_attempts(
        &self,
        atr_id: &str,
    ) -> Result<(HashMap<String, AtrEntry>, u64), StoreError> {
        let specs = [
            LookupSpec::get_xattr("attempts"),
            LookupSpec::get_xattr(VBUCKET_HLC_PATH),
        ];
        let result = self
            .store
            .collection(&self.collection)
            .lookup_in(
                atr_id,
                &specs,
                LookupOptions {
                    timeout: self.kv.timeout,
                    ..Default::default()
                },
            )
            .await;

        let found = match result {
            Ok(found) => found,
            // An ATR that no attempt has touched yet.
            Err(StoreError::DocumentNotFound(_)) => {
                return Ok((HashMap::new(), self.store.hlc_now_ms()))
            }
            Err(other) => return Err(other),
        };

        let attempts = match found.values[0].clone() {
            Some(value) => parse_attempts(value),
            None => HashMap::new(),
        };
        let hlc_ms = found.values[1]
            .as_ref()
            .and_then(|v| v["now_ms"].as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| self.store.hlc_now_ms());
        Ok((attempts, hlc_ms))
    }

    async fn remove_atr_entry(&self, atr_id: &str, attempt_id: &str) -> Result<(), StoreError> {
        let specs = [MutateSpec::remove_xattr(format!("attempts.{attempt_id}"))];
        let result = self
            .store
            .collection(&self.collection)
            .mutate_in(atr_id, &specs, self.mutate_options(StoreSemantics::Replace))
            .await;
        match result {
            Ok(_) => Ok(()),
            // Entry (or the whole ATR) already gone; removal is idempotent.
            Err(StoreError::PathNotFound(_) | StoreError::DocumentNotFound(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }
}

/// Entries that fail to deserialize are dropped rather than failing the
/// whole lookup; one malformed peer entry must not block cleanup.
fn parse_attempts(value: Value) -> HashMap<String, AtrEntry> {
    let Value::Object(map) = value else {
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(attempt_id, entry)| {
            serde_json::from_value::<AtrEntry>(entry)
                .ok()
                .map(|entry| (attempt_id, entry))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atr_index_is_stable_and_bounded() {
        let a = atr_index_for_key("doc-1", 0, 1024);
        assert_eq!(a, atr_index_for_key("doc-1", 0, 1024));
        assert!(a < 1024);
    }

    #[test]
    fn test_salt_moves_the_index() {
        // Not guaranteed for every key, but these differ for this one.
        let plain = atr_index_for_key("doc-1", 0, 1024);
        let salted = atr_index_for_key("doc-1", 1, 1024);
        assert_ne!(plain, salted);
    }

    #[tokio::test]
    async fn test_entry_roundtrip() {
        let store = Arc::new(DocStore::new());
        let repo = StoreAtrRepository::new(store.clone(), "_default", KvSettings::default());

        repo.create_atr_entry("_txn:atr-3", "a1", "t1", 15_000)
            .await
            .unwrap();
        repo.append_doc_record(
            "_txn:atr-3",
            "a1",
            StagedOpKind::Insert,
            &DocRecord {
                collection: "app".to_string(),
                id: "doc".to_string(),
            },
        )
        .await
        .unwrap();
        repo.set_atr_state("_txn:atr-3", "a1", AtrState::Committed)
            .await
            .unwrap();

        let (attempts, hlc_ms) = repo.lookup_attempts("_txn:atr-3").await.unwrap();
        assert!(hlc_ms > 0);
        let entry = &attempts["a1"];
        assert_eq!(entry.transaction_id, "t1");
        assert_eq!(entry.state, AtrState::Committed);
        assert_eq!(entry.expires_ms, 15_000);
        assert!(entry.start_cas.is_some());
        assert_eq!(entry.inserts.len(), 1);
        assert_eq!(entry.inserts[0].id, "doc");

        repo.remove_atr_entry("_txn:atr-3", "a1").await.unwrap();
        let (attempts, _) = repo.lookup_attempts("_txn:atr-3").await.unwrap();
        assert!(attempts.is_empty());
        // Removing again is a no-op
        repo.remove_atr_entry("_txn:atr-3", "a1").await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_on_untouched_atr() {
        let store = Arc::new(DocStore::new());
        let repo = StoreAtrRepository::new(store, "_default", KvSettings::default());
        let (attempts, hlc_ms) = repo.lookup_attempts("_txn:atr-9").await.unwrap();
        assert!(attempts.is_empty());
        assert!(hlc_ms > 0);
    }
}
