//! Idempotent executor of cleanup requests
//!
//! The cleaner re-reads the ATR entry and finishes whatever the attempt
//! started: unstaging for committed entries, rollback for pending and
//! aborted ones, then entry removal. Every step tolerates having lost a
//! race to the owning client or a concurrent cleaner.

use super::CleanupRequest;
use crate::repository::{AtrRepository, AtrState, DocRecord, DocumentRepository, StagedOpKind};
use coral_store::StoreError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Cleaner {
    docs: Arc<dyn DocumentRepository>,
    atrs: Arc<dyn AtrRepository>,
}

impl Cleaner {
    pub fn new(docs: Arc<dyn DocumentRepository>, atrs: Arc<dyn AtrRepository>) -> Self {
        Self { docs, atrs }
    }

    /// Resolve one request. Running this twice, or concurrently with
    /// another cleaner, leaves the same store state as running it once.
    pub async fn clean(&self, request: &CleanupRequest) -> Result<(), StoreError> {
        let (attempts, _) = self.atrs.lookup_attempts(&request.atr_id).await?;
        let Some(entry) = attempts.get(&request.attempt_id) else {
            return Ok(()); // already cleaned
        };

        let recorded: Vec<(StagedOpKind, DocRecord)> = entry
            .docs()
            .map(|(op, doc)| (op, doc.clone()))
            .collect();

        match entry.state {
            AtrState::Committed => {
                for (_, doc) in &recorded {
                    self.docs
                        .commit_staged_doc(&doc.collection, &doc.id, &request.attempt_id)
                        .await?;
                }
            }
            AtrState::Pending | AtrState::Aborted => {
                for (_, doc) in &recorded {
                    self.docs
                        .rollback_staged_doc(&doc.collection, &doc.id, &request.attempt_id)
                        .await?;
                }
            }
            AtrState::Completed => {}
        }

        self.atrs
            .remove_atr_entry(&request.atr_id, &request.attempt_id)
            .await
    }
}

/// Drain the local cleanup queue until the sender side closes, then
/// finish whatever is left; dispose awaits this task for the drain
/// guarantee.
pub(crate) fn spawn_drain(
    cleaner: Cleaner,
    mut rx: mpsc::Receiver<CleanupRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            if let Err(error) = cleaner.clean(&request).await {
                tracing::warn!(
                    atr_id = %request.atr_id,
                    attempt_id = %request.attempt_id,
                    "cleanup of local attempt failed: {}",
                    error
                );
            }
        }
    })
}
