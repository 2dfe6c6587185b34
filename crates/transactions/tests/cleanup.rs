//! Cleanup coordination: client record reaping, lost-attempt sweeping and
//! cleaner idempotence

use coral_hlc::format_mutation_cas;
use coral_store::{
    Collection, DocStore, LookupOptions, LookupSpec, MutateOptions, MutateSpec, StoreError,
    StoreSemantics,
};
use coral_transactions::{
    atr_id_for_index, AtrRepository, AtrState, Cleaner, CleanupRequest, DocRecord,
    DocumentRepository, KvSettings, StagedMeta, StagedOpKind, StoreAtrRepository,
    StoreDocumentRepository, Transactions, TransactionsConfig, CLIENT_RECORD_ID,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

fn repos(
    store: &Arc<DocStore>,
) -> (Arc<StoreDocumentRepository>, Arc<StoreAtrRepository>) {
    (
        Arc::new(StoreDocumentRepository::new(
            store.clone(),
            KvSettings::default(),
        )),
        Arc::new(StoreAtrRepository::new(
            store.clone(),
            "_default",
            KvSettings::default(),
        )),
    )
}

/// Stage an insert the way an attempt would, then abandon it: ATR entry
/// pending, staged tombstone on the document, owner gone.
async fn abandon_pending_insert(
    store: &Arc<DocStore>,
    collection: &str,
    id: &str,
    atr_id: &str,
    attempt_id: &str,
    expires_ms: u64,
) {
    let (docs, atrs) = repos(store);
    atrs.create_atr_entry(atr_id, attempt_id, "tx-abandoned", expires_ms)
        .await
        .unwrap();
    let meta = StagedMeta {
        transaction_id: "tx-abandoned".to_string(),
        attempt_id: attempt_id.to_string(),
        atr_id: atr_id.to_string(),
        atr_collection: "_default".to_string(),
    };
    docs.staged_insert(&meta, collection, id, &json!({"v": 1}), 0)
        .await
        .unwrap();
    atrs.append_doc_record(
        atr_id,
        attempt_id,
        StagedOpKind::Insert,
        &DocRecord {
            collection: collection.to_string(),
            id: id.to_string(),
        },
    )
    .await
    .unwrap();
}

/// Client entries of the client record document.
async fn client_entries(collection: &Collection) -> Map<String, Value> {
    let found = collection
        .lookup_in(
            CLIENT_RECORD_ID,
            &[LookupSpec::get_xattr("records.clients")],
            LookupOptions::default(),
        )
        .await
        .unwrap();
    match found.values[0].clone() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn cleaner_rolls_back_abandoned_pending_attempt() {
    let store = Arc::new(DocStore::new());
    let collection = store.collection("app");
    abandon_pending_insert(&store, "app", "ghost", "_txn:atr-1", "a1", 15_000).await;

    let (docs, atrs) = repos(&store);
    let cleaner = Cleaner::new(docs, atrs.clone());
    let request = CleanupRequest {
        atr_id: "_txn:atr-1".to_string(),
        atr_collection: "_default".to_string(),
        attempt_id: "a1".to_string(),
        transaction_id: "tx-abandoned".to_string(),
        state: AtrState::Pending,
        docs: Vec::new(),
    };

    cleaner.clean(&request).await.unwrap();

    // The staged insert never becomes visible and the entry is gone.
    assert_eq!(
        collection.get("ghost").await,
        Err(StoreError::DocumentNotFound("ghost".to_string()))
    );
    let (attempts, _) = atrs.lookup_attempts("_txn:atr-1").await.unwrap();
    assert!(attempts.is_empty());
}

#[tokio::test]
async fn cleaning_twice_is_the_same_as_cleaning_once() {
    let store = Arc::new(DocStore::new());
    let collection = store.collection("app");
    abandon_pending_insert(&store, "app", "ghost", "_txn:atr-2", "a2", 15_000).await;

    let (docs, atrs) = repos(&store);
    let cleaner = Cleaner::new(docs, atrs.clone());
    let request = CleanupRequest {
        atr_id: "_txn:atr-2".to_string(),
        atr_collection: "_default".to_string(),
        attempt_id: "a2".to_string(),
        transaction_id: "tx-abandoned".to_string(),
        state: AtrState::Pending,
        docs: Vec::new(),
    };

    cleaner.clean(&request).await.unwrap();
    cleaner.clean(&request).await.unwrap();

    assert_eq!(
        collection.get("ghost").await,
        Err(StoreError::DocumentNotFound("ghost".to_string()))
    );
    let (attempts, _) = atrs.lookup_attempts("_txn:atr-2").await.unwrap();
    assert!(attempts.is_empty());
}

#[tokio::test]
async fn cleaner_commits_an_abandoned_committed_attempt() {
    let store = Arc::new(DocStore::new());
    let collection = store.collection("app");
    abandon_pending_insert(&store, "app", "half", "_txn:atr-3", "a3", 15_000).await;

    let (docs, atrs) = repos(&store);
    // The owner got as far as the COMMITTED transition, then died.
    atrs.set_atr_state("_txn:atr-3", "a3", AtrState::Committed)
        .await
        .unwrap();

    let cleaner = Cleaner::new(docs, atrs.clone());
    let request = CleanupRequest {
        atr_id: "_txn:atr-3".to_string(),
        atr_collection: "_default".to_string(),
        attempt_id: "a3".to_string(),
        transaction_id: "tx-abandoned".to_string(),
        state: AtrState::Committed,
        docs: Vec::new(),
    };
    cleaner.clean(&request).await.unwrap();

    // Committed entries are rolled forward.
    assert_eq!(collection.get("half").await.unwrap().0, json!({"v": 1}));
    let (attempts, _) = atrs.lookup_attempts("_txn:atr-3").await.unwrap();
    assert!(attempts.is_empty());
}

#[tokio::test]
async fn heartbeat_reaps_expired_peer() {
    let store = Arc::new(DocStore::new());
    let metadata = store.collection("_default");

    // A peer whose heartbeat lease ran out long ago.
    let stale_heartbeat = format_mutation_cas(1_000_000);
    metadata
        .mutate_in(
            CLIENT_RECORD_ID,
            &[
                MutateSpec::set_doc(Value::Null),
                MutateSpec::upsert_xattr(
                    "records.clients.dead-peer",
                    json!({
                        "heartbeat_ms": stale_heartbeat,
                        "expires_ms": 1_000,
                        "num_atrs": 16,
                    }),
                ),
            ],
            MutateOptions {
                store_semantics: StoreSemantics::Insert,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let config = TransactionsConfig::new()
        .with_num_atrs(16)
        .with_cleanup_window(Duration::from_millis(320))
        .with_cleanup_client_attempts(false);
    let transactions = Transactions::create_with(store.clone(), config);

    // Let a few heartbeats run.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let entries = client_entries(&metadata).await;
    assert!(
        !entries.contains_key("dead-peer"),
        "expired peer should be reaped"
    );
    assert_eq!(entries.len(), 1, "only the live client remains");

    transactions.dispose().await;
    // Graceful shutdown deregisters the live client too.
    let entries = client_entries(&metadata).await;
    assert!(entries.is_empty());
}

#[tokio::test]
async fn malformed_peer_heartbeat_counts_as_expired() {
    let store = Arc::new(DocStore::new());
    let metadata = store.collection("_default");
    metadata
        .mutate_in(
            CLIENT_RECORD_ID,
            &[
                MutateSpec::set_doc(Value::Null),
                MutateSpec::upsert_xattr(
                    "records.clients.corrupt-peer",
                    json!({ "heartbeat_ms": "not-a-cas", "expires_ms": 60_000 }),
                ),
            ],
            MutateOptions {
                store_semantics: StoreSemantics::Insert,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let config = TransactionsConfig::new()
        .with_num_atrs(16)
        .with_cleanup_window(Duration::from_millis(320))
        .with_cleanup_client_attempts(false);
    let transactions = Transactions::create_with(store.clone(), config);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!client_entries(&metadata).await.contains_key("corrupt-peer"));
    transactions.dispose().await;
}

#[tokio::test]
async fn lost_attempt_sweep_rolls_back_abandoned_transaction() {
    let store = Arc::new(DocStore::new());
    let collection = store.collection("app");

    // An attempt whose lifetime already elapsed, on every ATR the sweep
    // will visit early.
    abandon_pending_insert(&store, "app", "orphan", &atr_id_for_index(0), "a-lost", 0).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let config = TransactionsConfig::new()
        .with_num_atrs(2)
        .with_cleanup_window(Duration::from_millis(40))
        .with_cleanup_client_attempts(false);
    let transactions = Transactions::create_with(store.clone(), config);

    // Two ATRs at a 20 ms tick: both swept well within this.
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(
        collection.get("orphan").await,
        Err(StoreError::DocumentNotFound("orphan".to_string()))
    );
    let (_, atrs) = repos(&store);
    let (attempts, _) = atrs.lookup_attempts(&atr_id_for_index(0)).await.unwrap();
    assert!(attempts.is_empty(), "abandoned entry should be swept");

    transactions.dispose().await;
}

#[tokio::test]
async fn registration_repairs_record_missing_the_records_field() {
    let store = Arc::new(DocStore::new());
    let metadata = store.collection("_default");
    // A corrupt record document: exists, but no `records` xattr.
    metadata.insert(CLIENT_RECORD_ID, Value::Null).await.unwrap();

    let config = TransactionsConfig::new()
        .with_num_atrs(16)
        .with_cleanup_window(Duration::from_millis(320))
        .with_cleanup_client_attempts(false);
    let transactions = Transactions::create_with(store.clone(), config);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Repaired and heartbeating.
    assert_eq!(client_entries(&metadata).await.len(), 1);
    transactions.dispose().await;
}
