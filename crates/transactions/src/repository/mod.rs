//! Repository contracts consumed by the attempt machinery
//!
//! The attempt context, cleaner and client record manager never talk to
//! the store directly; they go through these seams so the staging and ATR
//! wire formats stay in one place.

mod atr;
mod document;

pub use atr::{atr_id_for_index, StoreAtrRepository};
pub use document::StoreDocumentRepository;

pub(crate) use atr::atr_index_for_key;

use async_trait::async_trait;
use coral_store::{DurabilityLevel, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Store call settings derived from the effective transaction config.
#[derive(Debug, Clone, Default)]
pub struct KvSettings {
    pub durability: DurabilityLevel,
    pub timeout: Option<Duration>,
}

/// Kind of a staged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedOpKind {
    Insert,
    Replace,
    Remove,
}

/// Coordinates of a document touched by an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    #[serde(rename = "c")]
    pub collection: String,
    #[serde(rename = "id")]
    pub id: String,
}

/// Durable state of an ATR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtrState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "COMPLETED")]
    Completed,
}

/// One attempt's entry in an ATR document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrEntry {
    #[serde(rename = "tid")]
    pub transaction_id: String,
    #[serde(rename = "st")]
    pub state: AtrState,
    /// Mutation-CAS macro string written when the entry was created.
    #[serde(rename = "tst", default)]
    pub start_cas: Option<String>,
    /// Transaction lifetime in milliseconds.
    #[serde(rename = "exp", default)]
    pub expires_ms: u64,
    #[serde(rename = "ins", default)]
    pub inserts: Vec<DocRecord>,
    #[serde(rename = "rep", default)]
    pub replaces: Vec<DocRecord>,
    #[serde(rename = "rem", default)]
    pub removes: Vec<DocRecord>,
}

impl AtrEntry {
    /// All recorded documents with their staged-operation kinds.
    pub fn docs(&self) -> impl Iterator<Item = (StagedOpKind, &DocRecord)> {
        let inserts = self.inserts.iter().map(|d| (StagedOpKind::Insert, d));
        let replaces = self.replaces.iter().map(|d| (StagedOpKind::Replace, d));
        let removes = self.removes.iter().map(|d| (StagedOpKind::Remove, d));
        inserts.chain(replaces).chain(removes)
    }
}

/// Metadata tying a staged document to its attempt and ATR.
#[derive(Debug, Clone)]
pub struct StagedMeta {
    pub transaction_id: String,
    pub attempt_id: String,
    pub atr_id: String,
    pub atr_collection: String,
}

/// State of a document as seen by staging.
#[derive(Debug, Clone, Default)]
pub struct DocState {
    pub cas: u64,
    /// Any document is present, live or tombstone.
    pub exists: bool,
    /// A committed body is visible.
    pub live: bool,
    /// Transaction id of a staged mutation on the document, if any.
    pub staged_by: Option<String>,
}

/// Access to user documents: staging, unstaging and rollback of
/// individual mutations.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Committed body and CAS, or `None` when absent.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<(Value, u64)>, StoreError>;

    /// CAS, liveness and staging ownership, tombstones included.
    async fn staging_state(&self, collection: &str, id: &str) -> Result<DocState, StoreError>;

    async fn staged_insert(
        &self,
        meta: &StagedMeta,
        collection: &str,
        id: &str,
        body: &Value,
        cas: u64,
    ) -> Result<u64, StoreError>;

    async fn staged_replace(
        &self,
        meta: &StagedMeta,
        collection: &str,
        id: &str,
        body: &Value,
        cas: u64,
    ) -> Result<u64, StoreError>;

    async fn staged_remove(
        &self,
        meta: &StagedMeta,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<u64, StoreError>;

    /// Make a staged insert visible: body written, markers stripped.
    async fn unstage_insert(&self, collection: &str, id: &str, cas: u64)
        -> Result<(), StoreError>;

    /// Make a staged replace visible.
    async fn unstage_replace(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError>;

    /// Apply a staged remove: the document is deleted.
    async fn unstage_remove(&self, collection: &str, id: &str, cas: u64)
        -> Result<(), StoreError>;

    /// Roll back a staged insert: the staged tombstone loses its markers.
    async fn rollback_staged_insert(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError>;

    /// Roll back a staged replace or remove: markers stripped, committed
    /// body untouched.
    async fn rollback_staged_write(
        &self,
        collection: &str,
        id: &str,
        cas: u64,
    ) -> Result<(), StoreError>;

    /// Cleanup-side unstage: applies the staged mutation only if the
    /// document still carries `attempt_id`'s markers. Idempotent.
    async fn commit_staged_doc(
        &self,
        collection: &str,
        id: &str,
        attempt_id: &str,
    ) -> Result<(), StoreError>;

    /// Cleanup-side rollback counterpart of [`commit_staged_doc`].
    ///
    /// [`commit_staged_doc`]: DocumentRepository::commit_staged_doc
    async fn rollback_staged_doc(
        &self,
        collection: &str,
        id: &str,
        attempt_id: &str,
    ) -> Result<(), StoreError>;

    /// Pass-through to the transactional query service where available.
    async fn query(&self, statement: &str) -> Result<Vec<Value>, StoreError>;
}

/// Access to ATR documents.
#[async_trait]
pub trait AtrRepository: Send + Sync {
    async fn create_atr_entry(
        &self,
        atr_id: &str,
        attempt_id: &str,
        transaction_id: &str,
        expires_ms: u64,
    ) -> Result<(), StoreError>;

    async fn set_atr_state(
        &self,
        atr_id: &str,
        attempt_id: &str,
        state: AtrState,
    ) -> Result<(), StoreError>;

    /// Record a staged document in the entry's doc lists so cleanup can
    /// find it without the staging client.
    async fn append_doc_record(
        &self,
        atr_id: &str,
        attempt_id: &str,
        op: StagedOpKind,
        doc: &DocRecord,
    ) -> Result<(), StoreError>;

    /// All entries of an ATR document plus the server HLC in
    /// milliseconds, read together.
    async fn lookup_attempts(
        &self,
        atr_id: &str,
    ) -> Result<(HashMap<String, AtrEntry>, u64), StoreError>;

    /// Remove an entry; absent entries are fine.
    async fn remove_atr_entry(&self, atr_id: &str, attempt_id: &str) -> Result<(), StoreError>;
}
