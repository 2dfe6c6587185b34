//! Per-attempt transaction context
//!
//! One `AttemptContext` exists per driver iteration. It owns the staged
//! mutation list, enforces the monotonic attempt state machine, and is the
//! only component that talks to the repositories on behalf of user code.
//! The context is cheaply cloneable so lambdas can move it into async
//! blocks; internal state lives behind an `Arc`.

use crate::cleanup::CleanupRequest;
use crate::context::TransactionContext;
use crate::error::{classify, AttemptResult, ErrorClass, OperationFailed};
use crate::repository::{
    atr_index_for_key, atr_id_for_index, AtrRepository, AtrState, DocRecord, DocumentRepository,
    StagedMeta, StagedOpKind,
};
use coral_store::Collection;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Attempt lifecycle states.
///
/// Transitions are strictly monotonic: NotStarted → Pending →
/// {Aborted, Committed} → Completed. Aborted is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    NotStarted,
    Pending,
    Aborted,
    Committed,
    Completed,
}

impl AttemptState {
    fn may_transition_to(self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (NotStarted, Pending)
                | (NotStarted, Aborted)
                | (NotStarted, Completed)
                | (Pending, Aborted)
                | (Pending, Committed)
                | (Committed, Completed)
        )
    }
}

/// One staged mutation, in insertion order.
#[derive(Debug, Clone)]
pub(crate) struct StagedMutation {
    pub collection: String,
    pub id: String,
    pub op: StagedOpKind,
    pub staged_body: Option<Value>,
    pub cas: u64,
}

/// Which terminal operation has claimed the attempt; commit and rollback
/// are mutually exclusive and each runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminalOp {
    None,
    Commit,
    Rollback,
}

struct Inner {
    attempt_id: String,
    overall: Arc<TransactionContext>,
    docs: Arc<dyn DocumentRepository>,
    atrs: Arc<dyn AtrRepository>,
    state: Mutex<AttemptState>,
    staged: Mutex<Vec<StagedMutation>>,
    atr_id: Mutex<Option<String>>,
    atr_salt: u64,
    terminal_op: Mutex<TerminalOp>,
    unstaging_complete: AtomicBool,
}

/// Handle user code drives a single attempt through.
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<Inner>,
}

impl AttemptContext {
    pub(crate) fn new(
        overall: Arc<TransactionContext>,
        docs: Arc<dyn DocumentRepository>,
        atrs: Arc<dyn AtrRepository>,
        atr_salt: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                attempt_id: Uuid::new_v4().to_string(),
                overall,
                docs,
                atrs,
                state: Mutex::new(AttemptState::NotStarted),
                staged: Mutex::new(Vec::new()),
                atr_id: Mutex::new(None),
                atr_salt,
                terminal_op: Mutex::new(TerminalOp::None),
                unstaging_complete: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier of this attempt.
    pub fn attempt_id(&self) -> &str {
        &self.inner.attempt_id
    }

    /// Current attempt state.
    pub fn state(&self) -> AttemptState {
        *self.inner.state.lock()
    }

    /// Read a document. Staged writes of this attempt are visible; other
    /// transactions' staged writes are not (read-committed).
    pub async fn get(&self, collection: &Collection, id: &str) -> AttemptResult<Option<Value>> {
        self.check_expired("get")?;
        if let Some(staged) = self.find_staged(collection.name(), id) {
            return Ok(match staged.op {
                StagedOpKind::Remove => None,
                _ => staged.staged_body,
            });
        }
        let found = self
            .inner
            .docs
            .get(collection.name(), id)
            .await
            .map_err(classify)?;
        Ok(found.map(|(body, _)| body))
    }

    /// Stage an insert of a new document.
    pub async fn insert(&self, collection: &Collection, id: &str, body: Value) -> AttemptResult<()> {
        self.check_expired("insert")?;
        self.check_can_stage()?;

        if let Some(staged) = self.find_staged(collection.name(), id) {
            return match staged.op {
                // Insert after own staged remove nets out to a replace.
                StagedOpKind::Remove => self.restage(collection.name(), id, StagedOpKind::Replace, Some(body), staged.cas).await,
                _ => Err(classify(coral_store::StoreError::DocumentExists(
                    id.to_string(),
                ))),
            };
        }

        let atr_id = self.ensure_pending(id).await?;
        let state = self
            .inner
            .docs
            .staging_state(collection.name(), id)
            .await
            .map_err(classify)?;
        self.check_conflict(&state, id)?;
        if state.live {
            return Err(classify(coral_store::StoreError::DocumentExists(
                id.to_string(),
            )));
        }

        let meta = self.staged_meta(&atr_id);
        let cas = self
            .inner
            .docs
            .staged_insert(&meta, collection.name(), id, &body, state.cas)
            .await
            .map_err(classify)?;
        self.record_staged(&atr_id, collection.name(), id, StagedOpKind::Insert, Some(body), cas)
            .await
    }

    /// Stage a replacement of an existing document's body.
    pub async fn replace(
        &self,
        collection: &Collection,
        id: &str,
        body: Value,
    ) -> AttemptResult<()> {
        self.check_expired("replace")?;
        self.check_can_stage()?;

        if let Some(staged) = self.find_staged(collection.name(), id) {
            return match staged.op {
                StagedOpKind::Remove => Err(classify(coral_store::StoreError::DocumentNotFound(
                    id.to_string(),
                ))),
                op => self.restage(collection.name(), id, op, Some(body), staged.cas).await,
            };
        }

        let atr_id = self.ensure_pending(id).await?;
        let state = self
            .inner
            .docs
            .staging_state(collection.name(), id)
            .await
            .map_err(classify)?;
        self.check_conflict(&state, id)?;
        if !state.live {
            return Err(classify(coral_store::StoreError::DocumentNotFound(
                id.to_string(),
            )));
        }

        let meta = self.staged_meta(&atr_id);
        let cas = self
            .inner
            .docs
            .staged_replace(&meta, collection.name(), id, &body, state.cas)
            .await
            .map_err(classify)?;
        self.record_staged(
            &atr_id,
            collection.name(),
            id,
            StagedOpKind::Replace,
            Some(body),
            cas,
        )
        .await
    }

    /// Stage a removal of an existing document.
    pub async fn remove(&self, collection: &Collection, id: &str) -> AttemptResult<()> {
        self.check_expired("remove")?;
        self.check_can_stage()?;

        if let Some(staged) = self.find_staged(collection.name(), id) {
            return match staged.op {
                StagedOpKind::Remove => Err(classify(coral_store::StoreError::DocumentNotFound(
                    id.to_string(),
                ))),
                // Remove after own staged insert cancels the insert.
                StagedOpKind::Insert => {
                    self.inner
                        .docs
                        .rollback_staged_insert(collection.name(), id, staged.cas)
                        .await
                        .map_err(classify)?;
                    self.drop_staged(collection.name(), id);
                    Ok(())
                }
                StagedOpKind::Replace => {
                    self.restage(collection.name(), id, StagedOpKind::Remove, None, staged.cas)
                        .await
                }
            };
        }

        let atr_id = self.ensure_pending(id).await?;
        let state = self
            .inner
            .docs
            .staging_state(collection.name(), id)
            .await
            .map_err(classify)?;
        self.check_conflict(&state, id)?;
        if !state.live {
            return Err(classify(coral_store::StoreError::DocumentNotFound(
                id.to_string(),
            )));
        }

        let meta = self.staged_meta(&atr_id);
        let cas = self
            .inner
            .docs
            .staged_remove(&meta, collection.name(), id, state.cas)
            .await
            .map_err(classify)?;
        self.record_staged(&atr_id, collection.name(), id, StagedOpKind::Remove, None, cas)
            .await
    }

    /// Pass-through to the transactional query service where available.
    pub async fn query(&self, statement: &str) -> AttemptResult<Vec<Value>> {
        self.check_expired("query")?;
        self.inner.docs.query(statement).await.map_err(classify)
    }

    /// Commit the attempt explicitly; the driver does this implicitly
    /// when the lambda returns with the attempt still pending.
    pub async fn commit(&self) -> AttemptResult<()> {
        self.commit_internal().await
    }

    /// Roll the attempt back. The transaction completes without error and
    /// without applying any staged mutation.
    pub async fn rollback(&self) -> AttemptResult<()> {
        self.rollback_internal(true).await
    }

    pub(crate) fn unstaging_complete(&self) -> bool {
        self.inner.unstaging_complete.load(Ordering::SeqCst)
    }

    /// Descriptor handed to the cleanup queue once the attempt has
    /// terminated; `None` when the attempt never crossed Pending.
    pub(crate) fn cleanup_request(&self) -> Option<CleanupRequest> {
        let atr_id = self.inner.atr_id.lock().clone()?;
        let state = match self.state() {
            AttemptState::NotStarted => return None,
            AttemptState::Pending => AtrState::Pending,
            AttemptState::Aborted => AtrState::Aborted,
            AttemptState::Committed => AtrState::Committed,
            AttemptState::Completed => AtrState::Completed,
        };
        let docs = self
            .inner
            .staged
            .lock()
            .iter()
            .map(|m| {
                (
                    m.op,
                    DocRecord {
                        collection: m.collection.clone(),
                        id: m.id.clone(),
                    },
                )
            })
            .collect();
        Some(CleanupRequest {
            atr_id,
            atr_collection: self.inner.overall.config().metadata_collection.clone(),
            attempt_id: self.inner.attempt_id.clone(),
            transaction_id: self.inner.overall.transaction_id().to_string(),
            state,
            docs,
        })
    }

    /// Commit path: ATR to COMMITTED, unstage in insertion order, ATR
    /// entry removed. Failures before the COMMITTED transition follow the
    /// normal retry policy; failures after it are post-commit.
    pub(crate) async fn commit_internal(&self) -> AttemptResult<()> {
        self.claim_terminal(TerminalOp::Commit)?;

        let state = self.state();
        match state {
            AttemptState::NotStarted => {
                // Nothing staged; the attempt completes trivially.
                self.advance(AttemptState::Completed)?;
                self.inner.unstaging_complete.store(true, Ordering::SeqCst);
                return Ok(());
            }
            AttemptState::Pending => {}
            _ => return Err(OperationFailed::invariant(format!(
                "commit from state {state:?}"
            ))),
        }

        let atr_id = self.atr_id_or_invariant()?;
        if let Err(error) = self
            .inner
            .atrs
            .set_atr_state(&atr_id, &self.inner.attempt_id, AtrState::Committed)
            .await
        {
            let failure = classify(error);
            if failure.class() == ErrorClass::Ambiguous {
                // The write may have landed; the outcome is unknowable
                // from here and only cleanup can resolve it.
                return Err(failure.into_commit_ambiguous());
            }
            // The entry never reached COMMITTED; the attempt is still
            // pending and may be rolled back.
            *self.inner.terminal_op.lock() = TerminalOp::None;
            return Err(failure);
        }
        self.advance(AttemptState::Committed)?;

        let staged = self.inner.staged.lock().clone();
        for mutation in staged {
            let outcome = match mutation.op {
                StagedOpKind::Insert => {
                    self.inner
                        .docs
                        .unstage_insert(&mutation.collection, &mutation.id, mutation.cas)
                        .await
                }
                StagedOpKind::Replace => {
                    self.inner
                        .docs
                        .unstage_replace(&mutation.collection, &mutation.id, mutation.cas)
                        .await
                }
                StagedOpKind::Remove => {
                    self.inner
                        .docs
                        .unstage_remove(&mutation.collection, &mutation.id, mutation.cas)
                        .await
                }
            };
            if let Err(error) = outcome {
                return Err(classify(error).into_post_commit());
            }
        }

        self.inner.unstaging_complete.store(true, Ordering::SeqCst);
        self.advance(AttemptState::Completed)?;
        if let Err(error) = self
            .inner
            .atrs
            .remove_atr_entry(&atr_id, &self.inner.attempt_id)
            .await
        {
            // Cleanup will remove the completed entry.
            tracing::warn!(atr_id = %atr_id, "failed to remove completed ATR entry: {}", error);
        }
        Ok(())
    }

    /// Rollback path: ATR to ABORTED, staged mutations rolled back.
    /// Idempotent; a no-op once the attempt is terminal.
    pub(crate) async fn rollback_internal(&self, app_initiated: bool) -> AttemptResult<()> {
        let state = self.state();
        if matches!(state, AttemptState::Aborted | AttemptState::Completed) {
            return Ok(());
        }
        {
            let mut terminal = self.inner.terminal_op.lock();
            match *terminal {
                TerminalOp::Rollback => return Ok(()),
                TerminalOp::Commit => {
                    return Err(OperationFailed::invariant("rollback after commit"))
                }
                TerminalOp::None => *terminal = TerminalOp::Rollback,
            }
        }
        tracing::debug!(
            attempt_id = %self.inner.attempt_id,
            app_initiated,
            "rolling back attempt"
        );

        if state == AttemptState::NotStarted {
            self.advance(AttemptState::Aborted)?;
            return Ok(());
        }

        let atr_id = self.atr_id_or_invariant()?;
        self.inner
            .atrs
            .set_atr_state(&atr_id, &self.inner.attempt_id, AtrState::Aborted)
            .await
            .map_err(classify)?;

        let staged = self.inner.staged.lock().clone();
        for mutation in staged {
            match mutation.op {
                StagedOpKind::Insert => self
                    .inner
                    .docs
                    .rollback_staged_insert(&mutation.collection, &mutation.id, mutation.cas)
                    .await
                    .map_err(classify)?,
                StagedOpKind::Replace | StagedOpKind::Remove => self
                    .inner
                    .docs
                    .rollback_staged_write(&mutation.collection, &mutation.id, mutation.cas)
                    .await
                    .map_err(classify)?,
            }
        }

        self.advance(AttemptState::Aborted)?;
        if let Err(error) = self
            .inner
            .atrs
            .remove_atr_entry(&atr_id, &self.inner.attempt_id)
            .await
        {
            tracing::warn!(atr_id = %atr_id, "failed to remove aborted ATR entry: {}", error);
        }
        Ok(())
    }

    fn check_expired(&self, operation: &str) -> AttemptResult<()> {
        if self.inner.overall.is_expired() {
            return Err(OperationFailed::expired(operation));
        }
        Ok(())
    }

    fn check_can_stage(&self) -> AttemptResult<()> {
        let state = self.state();
        match state {
            AttemptState::NotStarted | AttemptState::Pending => Ok(()),
            _ => Err(OperationFailed::invariant(format!(
                "mutation in state {state:?}"
            ))),
        }
    }

    fn check_conflict(&self, state: &crate::repository::DocState, id: &str) -> AttemptResult<()> {
        match &state.staged_by {
            Some(owner) if owner != self.inner.overall.transaction_id() => {
                Err(OperationFailed::write_write_conflict(id))
            }
            _ => Ok(()),
        }
    }

    fn claim_terminal(&self, op: TerminalOp) -> AttemptResult<()> {
        let mut terminal = self.inner.terminal_op.lock();
        match *terminal {
            TerminalOp::None => {
                *terminal = op;
                Ok(())
            }
            TerminalOp::Commit => Err(OperationFailed::invariant("commit invoked twice")),
            TerminalOp::Rollback => Err(OperationFailed::invariant("commit after rollback")),
        }
    }

    fn advance(&self, next: AttemptState) -> AttemptResult<()> {
        let mut state = self.inner.state.lock();
        if !state.may_transition_to(next) {
            return Err(OperationFailed::invariant(format!(
                "illegal transition {:?} -> {next:?}",
                *state
            )));
        }
        *state = next;
        Ok(())
    }

    /// Lazily create the ATR entry and move to Pending on first staging.
    async fn ensure_pending(&self, first_key: &str) -> AttemptResult<String> {
        if let Some(atr_id) = self.inner.atr_id.lock().clone() {
            return Ok(atr_id);
        }
        let config = self.inner.overall.config();
        let index = atr_index_for_key(first_key, self.inner.atr_salt, config.num_atrs);
        let atr_id = atr_id_for_index(index);
        self.inner
            .atrs
            .create_atr_entry(
                &atr_id,
                &self.inner.attempt_id,
                self.inner.overall.transaction_id(),
                self.inner.overall.expires_ms(),
            )
            .await
            .map_err(classify)?;
        self.advance(AttemptState::Pending)?;
        *self.inner.atr_id.lock() = Some(atr_id.clone());
        Ok(atr_id)
    }

    fn staged_meta(&self, atr_id: &str) -> StagedMeta {
        StagedMeta {
            transaction_id: self.inner.overall.transaction_id().to_string(),
            attempt_id: self.inner.attempt_id.clone(),
            atr_id: atr_id.to_string(),
            atr_collection: self.inner.overall.config().metadata_collection.clone(),
        }
    }

    fn find_staged(&self, collection: &str, id: &str) -> Option<StagedMutation> {
        self.inner
            .staged
            .lock()
            .iter()
            .find(|m| m.collection == collection && m.id == id)
            .cloned()
    }

    fn drop_staged(&self, collection: &str, id: &str) {
        self.inner
            .staged
            .lock()
            .retain(|m| !(m.collection == collection && m.id == id));
    }

    /// Re-stage an already-staged document in place, keeping its slot in
    /// the unstage order.
    async fn restage(
        &self,
        collection: &str,
        id: &str,
        op: StagedOpKind,
        body: Option<Value>,
        cas: u64,
    ) -> AttemptResult<()> {
        let atr_id = self.atr_id_or_invariant()?;
        let meta = self.staged_meta(&atr_id);
        let new_cas = match op {
            StagedOpKind::Insert => {
                self.inner
                    .docs
                    .staged_insert(&meta, collection, id, body.as_ref().unwrap_or(&Value::Null), cas)
                    .await
            }
            StagedOpKind::Replace => {
                self.inner
                    .docs
                    .staged_replace(&meta, collection, id, body.as_ref().unwrap_or(&Value::Null), cas)
                    .await
            }
            StagedOpKind::Remove => {
                self.inner
                    .docs
                    .staged_remove(&meta, collection, id, cas)
                    .await
            }
        }
        .map_err(classify)?;

        let mut staged = self.inner.staged.lock();
        if let Some(existing) = staged
            .iter_mut()
            .find(|m| m.collection == collection && m.id == id)
        {
            existing.op = op;
            existing.staged_body = body;
            existing.cas = new_cas;
        }
        Ok(())
    }

    async fn record_staged(
        &self,
        atr_id: &str,
        collection: &str,
        id: &str,
        op: StagedOpKind,
        staged_body: Option<Value>,
        cas: u64,
    ) -> AttemptResult<()> {
        self.inner
            .atrs
            .append_doc_record(
                atr_id,
                &self.inner.attempt_id,
                op,
                &DocRecord {
                    collection: collection.to_string(),
                    id: id.to_string(),
                },
            )
            .await
            .map_err(classify)?;
        self.inner.staged.lock().push(StagedMutation {
            collection: collection.to_string(),
            id: id.to_string(),
            op,
            staged_body,
            cas,
        });
        Ok(())
    }

    fn atr_id_or_invariant(&self) -> AttemptResult<String> {
        self.inner
            .atr_id
            .lock()
            .clone()
            .ok_or_else(|| OperationFailed::invariant("attempt has no ATR"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_is_monotonic() {
        use AttemptState::*;
        let legal = [
            (NotStarted, Pending),
            (NotStarted, Aborted),
            (NotStarted, Completed),
            (Pending, Aborted),
            (Pending, Committed),
            (Committed, Completed),
        ];
        for (from, to) in legal {
            assert!(from.may_transition_to(to), "{from:?} -> {to:?}");
        }

        let illegal = [
            (Pending, NotStarted),
            (Committed, Pending),
            (Committed, Aborted),
            (Aborted, Committed),
            (Aborted, Completed),
            (Completed, Pending),
            (Pending, Pending),
        ];
        for (from, to) in illegal {
            assert!(!from.may_transition_to(to), "{from:?} -> {to:?}");
        }
    }
}
