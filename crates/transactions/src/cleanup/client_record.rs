//! Client record protocol
//!
//! Liveness and fairness of lost-attempt cleanup are coordinated through
//! a single well-known document per metadata collection. Each client owns
//! one entry under the `records.clients` extended attribute:
//!
//! ```json
//! { "<client uuid>": { "heartbeat_ms": "<mutation-CAS macro>",
//!                      "expires_ms": <lease length>,
//!                      "num_atrs": <configured count> } }
//! ```
//!
//! Peers are judged against the server's HLC, never local wall time: an
//! entry whose parsed heartbeat plus lease falls before `$vbucket.HLC` is
//! expired and gets reaped by whichever live client sees it first. Live
//! clients sorted lexically partition the ATR index space; partitions
//! only change on membership change, and overlap during a transition is
//! harmless because cleanup is idempotent.

use super::cleaner::Cleaner;
use super::CleanupRequest;
use crate::config::TransactionsConfig;
use crate::repository::{atr_id_for_index, AtrRepository};
use coral_hlc::parse_mutation_cas;
use coral_store::{
    Collection, DocStore, LookupOptions, LookupSpec, MutateOptions, MutateSpec, StoreError,
    StoreSemantics, MAX_SPECS, VBUCKET_HLC_PATH,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Well-known id of the client record document.
pub const CLIENT_RECORD_ID: &str = "_txn:client-record";

/// Margin added to the cleanup window when computing a client's lease.
const SAFETY_MARGIN_MS: u64 = 20_000;

/// Specs the heartbeat mutation always carries (heartbeat, lease, count).
const FIXED_HEARTBEAT_SPECS: usize = 3;

/// Expired peers reaped per heartbeat, bounded by the server's per-call
/// spec cap.
const MAX_REAPS_PER_HEARTBEAT: usize = MAX_SPECS - FIXED_HEARTBEAT_SPECS;

/// Best-effort deregistration deadline on shutdown.
const DEREGISTER_TIMEOUT: Duration = Duration::from_millis(500);

/// Background task coordinating this client's share of lost-attempt
/// cleanup for one metadata collection.
pub struct ClientRecordManager {
    client_id: String,
    collection: Collection,
    atrs: Arc<dyn AtrRepository>,
    cleaner: Cleaner,
    config: TransactionsConfig,
}

pub(crate) struct ClientRecordHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ClientRecordHandle {
    /// Cooperative shutdown: the manager deregisters, then the task ends.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }

    /// Hard stop without deregistration; the heartbeat lease reaps the
    /// stale entry.
    pub fn abort(self) {
        self.task.abort();
    }
}

impl ClientRecordManager {
    pub fn new(
        store: Arc<DocStore>,
        atrs: Arc<dyn AtrRepository>,
        cleaner: Cleaner,
        config: TransactionsConfig,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            collection: store.collection(config.metadata_collection.clone()),
            atrs,
            cleaner,
            config,
        }
    }

    /// Uuid under which this client registers.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn start(self) -> ClientRecordHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        ClientRecordHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        if let Err(error) = self.register().await {
            tracing::warn!("client record registration failed: {}", error);
        }

        let period = heartbeat_period(&self.config);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut owned: Vec<usize> = Vec::new();
        let mut cursor = 0usize;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    match self.heartbeat().await {
                        Ok(live) => owned = partition(&live, &self.client_id, self.config.num_atrs),
                        Err(error) => {
                            tracing::warn!(client_id = %self.client_id, "heartbeat failed: {}", error);
                            continue;
                        }
                    }
                    if !owned.is_empty() {
                        let index = owned[cursor % owned.len()];
                        cursor = cursor.wrapping_add(1);
                        if let Err(error) = self.sweep_atr(index).await {
                            tracing::debug!("sweep of atr {} failed: {}", index, error);
                        }
                    }
                }
            }
        }

        self.deregister().await;
    }

    /// Create the record if needed; an existing one is reused, and one
    /// missing the `records` field is repaired with an unchecked upsert.
    async fn register(&self) -> Result<(), StoreError> {
        let specs = [
            MutateSpec::set_doc(Value::Null),
            MutateSpec::upsert_xattr("records.clients", json!({})),
        ];
        let options = MutateOptions {
            store_semantics: StoreSemantics::Insert,
            durability: self.config.durability_level,
            timeout: self.config.key_value_timeout,
            ..Default::default()
        };
        match self
            .collection
            .mutate_in(CLIENT_RECORD_ID, &specs, options)
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::DocumentExists(_)) => self.repair_missing_records().await,
            Err(other) => Err(other),
        }
    }

    async fn repair_missing_records(&self) -> Result<(), StoreError> {
        let found = self
            .collection
            .lookup_in(
                CLIENT_RECORD_ID,
                &[LookupSpec::get_xattr("records")],
                LookupOptions::default(),
            )
            .await?;
        if found.values[0].is_some() {
            return Ok(());
        }
        let specs = [MutateSpec::upsert_xattr("records.clients", json!({}))];
        let options = MutateOptions {
            cas: 0,
            store_semantics: StoreSemantics::Upsert,
            ..Default::default()
        };
        self.collection
            .mutate_in(CLIENT_RECORD_ID, &specs, options)
            .await?;
        Ok(())
    }

    /// Refresh our own entry and reap expired peers in the same
    /// mutation. Returns the live client uuids, sorted, self included.
    async fn heartbeat(&self) -> Result<Vec<String>, StoreError> {
        let found = self
            .collection
            .lookup_in(
                CLIENT_RECORD_ID,
                &[
                    LookupSpec::get_xattr("records.clients"),
                    LookupSpec::get_xattr(VBUCKET_HLC_PATH),
                ],
                LookupOptions {
                    timeout: self.config.key_value_timeout,
                    ..Default::default()
                },
            )
            .await?;

        let clients = match found.values[0].clone() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let now_ms = found.values[1]
            .as_ref()
            .and_then(|v| v["now_ms"].as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_default();

        let mut live = Vec::new();
        let mut expired = Vec::new();
        for (uuid, entry) in &clients {
            if uuid == &self.client_id {
                continue; // refreshed below
            }
            if entry_is_expired(entry, now_ms) {
                expired.push(uuid.clone());
            } else {
                live.push(uuid.clone());
            }
        }

        let own = format!("records.clients.{}", self.client_id);
        let lease_ms = self.config.cleanup_window.as_millis() as u64 + SAFETY_MARGIN_MS;
        let mut specs = vec![
            MutateSpec::upsert_xattr_macro(format!("{own}.heartbeat_ms")),
            MutateSpec::upsert_xattr(format!("{own}.expires_ms"), json!(lease_ms)),
            MutateSpec::upsert_xattr(format!("{own}.num_atrs"), json!(self.config.num_atrs)),
        ];
        for uuid in expired.iter().take(MAX_REAPS_PER_HEARTBEAT) {
            specs.push(MutateSpec::remove_xattr(format!("records.clients.{uuid}")));
        }
        let options = MutateOptions {
            durability: self.config.durability_level,
            timeout: self.config.key_value_timeout,
            ..Default::default()
        };
        self.collection
            .mutate_in(CLIENT_RECORD_ID, &specs, options)
            .await?;

        live.push(self.client_id.clone());
        live.sort();
        Ok(live)
    }

    /// Hand every expired entry of one owned ATR to the cleaner.
    async fn sweep_atr(&self, index: usize) -> Result<(), StoreError> {
        let atr_id = atr_id_for_index(index);
        let (attempts, hlc_ms) = self.atrs.lookup_attempts(&atr_id).await?;

        for (attempt_id, entry) in attempts {
            let abandoned = match entry.start_cas.as_deref().map(parse_mutation_cas) {
                Some(Ok(start)) => start.as_millis() + entry.expires_ms < hlc_ms,
                // Unparseable or missing start: treat as abandoned rather
                // than letting a malformed entry linger forever.
                _ => true,
            };
            if !abandoned {
                continue;
            }
            let request = CleanupRequest {
                atr_id: atr_id.clone(),
                atr_collection: self.collection.name().to_string(),
                attempt_id: attempt_id.clone(),
                transaction_id: entry.transaction_id.clone(),
                state: entry.state,
                docs: entry.docs().map(|(op, doc)| (op, doc.clone())).collect(),
            };
            if let Err(error) = self.cleaner.clean(&request).await {
                tracing::debug!(
                    atr_id = %request.atr_id,
                    attempt_id = %request.attempt_id,
                    "lost-attempt cleanup failed: {}",
                    error
                );
            }
        }
        Ok(())
    }

    /// Remove our own entry with a short, non-durable deadline; a failure
    /// just means a peer reaps the stale entry after the lease runs out.
    async fn deregister(&self) {
        let specs = [MutateSpec::remove_xattr(format!(
            "records.clients.{}",
            self.client_id
        ))];
        let options = MutateOptions {
            timeout: Some(DEREGISTER_TIMEOUT),
            ..Default::default()
        };
        if let Err(error) = self
            .collection
            .mutate_in(CLIENT_RECORD_ID, &specs, options)
            .await
        {
            tracing::warn!(client_id = %self.client_id, "deregistration failed: {}", error);
        }
    }
}

/// Heartbeat period: the cleanup window spread over the ATR count, so a
/// full sweep of owned ATRs fits inside one window.
fn heartbeat_period(config: &TransactionsConfig) -> Duration {
    let per_atr = config.cleanup_window.as_millis() as u64 / config.num_atrs.max(1) as u64;
    Duration::from_millis(per_atr.max(1))
}

/// A peer entry is expired iff its parsed heartbeat plus lease falls
/// before the server HLC; unparseable entries count as expired.
fn entry_is_expired(entry: &Value, now_ms: u64) -> bool {
    let Some(heartbeat) = entry["heartbeat_ms"].as_str() else {
        return true;
    };
    let Ok(parsed) = parse_mutation_cas(heartbeat) else {
        return true;
    };
    let lease_ms = entry["expires_ms"].as_u64().unwrap_or(0);
    parsed.as_millis() + lease_ms < now_ms
}

/// ATR indices owned by `own` among `live` (sorted) clients: every index
/// congruent to our rank modulo the live count.
fn partition(live: &[String], own: &str, num_atrs: usize) -> Vec<usize> {
    let Some(rank) = live.iter().position(|client| client == own) else {
        return Vec::new();
    };
    (0..num_atrs)
        .filter(|index| index % live.len() == rank)
        .collect()
}
