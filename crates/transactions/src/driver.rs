//! Attempt driver
//!
//! Runs the lambda once against a fresh attempt context, auto-commits,
//! applies the rollback policy to classified failures, and hands the
//! attempt off to cleanup. No unclassified failure leaves this module.

use crate::attempt::{AttemptContext, AttemptState};
use crate::cleanup::CleanupSender;
use crate::context::TransactionContext;
use crate::error::{AttemptResult, ErrorClass, FinalErrorKind, OperationFailed};
use crate::repository::{AtrRepository, DocumentRepository};
use std::future::Future;
use std::sync::Arc;

/// What a finished attempt reports back to the runner.
pub(crate) struct AttemptSummary {
    pub unstaging_complete: bool,
}

pub(crate) struct AttemptDriver {
    docs: Arc<dyn DocumentRepository>,
    atrs: Arc<dyn AtrRepository>,
    cleanup: CleanupSender,
}

impl AttemptDriver {
    pub fn new(
        docs: Arc<dyn DocumentRepository>,
        atrs: Arc<dyn AtrRepository>,
        cleanup: CleanupSender,
    ) -> Self {
        Self {
            docs,
            atrs,
            cleanup,
        }
    }

    /// Run one attempt to a classified outcome.
    pub async fn run_once<F, Fut>(
        &self,
        lambda: &F,
        overall: &Arc<TransactionContext>,
        atr_salt: u64,
    ) -> Result<AttemptSummary, OperationFailed>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = AttemptResult<()>>,
    {
        let ctx = AttemptContext::new(
            overall.clone(),
            self.docs.clone(),
            self.atrs.clone(),
            atr_salt,
        );

        let outcome = match self.execute(&ctx, lambda).await {
            Ok(()) => Ok(AttemptSummary {
                unstaging_complete: ctx.unstaging_complete(),
            }),
            Err(failure) => Err(self.resolve_failure(&ctx, overall, failure).await),
        };

        // The attempt has terminated either way; publish its descriptor.
        if let Some(request) = ctx.cleanup_request() {
            self.cleanup.offer(request);
        }
        outcome
    }

    async fn execute<F, Fut>(&self, ctx: &AttemptContext, lambda: &F) -> AttemptResult<()>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = AttemptResult<()>>,
    {
        lambda(ctx.clone()).await?;
        // Auto-commit unless the lambda already committed or rolled back.
        if matches!(
            ctx.state(),
            AttemptState::NotStarted | AttemptState::Pending
        ) {
            ctx.commit_internal().await?;
        }
        Ok(())
    }

    /// Rollback policy plus the expiry override of the driver contract.
    async fn resolve_failure(
        &self,
        ctx: &AttemptContext,
        overall: &Arc<TransactionContext>,
        mut failure: OperationFailed,
    ) -> OperationFailed {
        if failure.rollback() {
            if let Err(rollback_failure) = ctx.rollback_internal(false).await {
                // A failed durable rollback leaves conflicting staged
                // state; retrying would collide with it.
                tracing::warn!(
                    attempt_id = %ctx.attempt_id(),
                    "rollback after failed attempt also failed: {}",
                    rollback_failure
                );
                failure = failure.into_rollback_failed();
            }
        }

        // Past the commit point the outcome is already decided; expiry
        // must not re-label it.
        let decided = matches!(
            failure.final_error(),
            FinalErrorKind::CommitAmbiguous | FinalErrorKind::FailedPostCommit
        );
        if overall.is_expired() && failure.class() != ErrorClass::Expiry && !decided {
            failure = OperationFailed::expired_from(failure);
        }
        failure
    }
}
