//! Error taxonomy and classification
//!
//! Every failure raised inside an attempt is converted into a classified
//! [`OperationFailed`] before it reaches the runner. The four fields are
//! orthogonal: the class names the originating condition, `retry` and
//! `rollback` drive the driver's policy, and `raise` picks the surface
//! error once the failure is final. `raise` is only observed when `retry`
//! is false.

use crate::result::TransactionResult;
use coral_store::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Classification of a failure's originating condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Expiry,
    Ambiguous,
    CasMismatch,
    DocNotFound,
    DocAlreadyExists,
    Transient,
    Hard,
    Other,
    AtrFull,
    PathNotFound,
    WriteWriteConflict,
}

/// Surface error the runner raises (or, for post-commit failures, does
/// not raise) once an attempt is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalErrorKind {
    Failed,
    Expired,
    CommitAmbiguous,
    FailedPostCommit,
}

/// A classified attempt failure.
#[derive(Debug, Clone, Error)]
#[error("attempt failed ({class:?}): {detail}")]
pub struct OperationFailed {
    class: ErrorClass,
    retry: bool,
    rollback: bool,
    raise: FinalErrorKind,
    detail: String,
    #[source]
    cause: Option<Arc<StoreError>>,
}

impl OperationFailed {
    fn new(class: ErrorClass, retry: bool, rollback: bool, raise: FinalErrorKind) -> Self {
        Self {
            class,
            retry,
            rollback,
            raise,
            detail: String::new(),
            cause: None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn retry(&self) -> bool {
        self.retry
    }

    pub fn rollback(&self) -> bool {
        self.rollback
    }

    pub fn final_error(&self) -> FinalErrorKind {
        self.raise
    }

    pub fn cause(&self) -> Option<&StoreError> {
        self.cause.as_deref()
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    fn with_cause(mut self, cause: StoreError) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Failure produced by application code inside the lambda.
    pub fn app(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Other, false, true, FinalErrorKind::Failed).with_detail(detail)
    }

    /// Violation of the attempt state machine; a bug, never retried.
    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        Self::new(ErrorClass::Hard, false, false, FinalErrorKind::Failed).with_detail(detail)
    }

    /// Expiry observed before or between operations. Rollback is not
    /// attempted past this point.
    pub(crate) fn expired(at: &str) -> Self {
        Self::new(ErrorClass::Expiry, false, false, FinalErrorKind::Expired)
            .with_detail(format!("expired at {at}"))
    }

    /// Rebuild an arbitrary failure as expiry, preserving its cause.
    pub(crate) fn expired_from(failure: OperationFailed) -> Self {
        Self {
            class: ErrorClass::Expiry,
            retry: false,
            rollback: false,
            raise: FinalErrorKind::Expired,
            detail: failure.detail,
            cause: failure.cause,
        }
    }

    /// Another transaction's staged mutation is on the document.
    pub(crate) fn write_write_conflict(id: &str) -> Self {
        Self::new(
            ErrorClass::WriteWriteConflict,
            true,
            true,
            FinalErrorKind::Failed,
        )
        .with_detail(format!("document {id} is staged by another transaction"))
    }

    /// Rebuild for a failure during the COMMITTED transition whose
    /// durability outcome is unknown.
    pub(crate) fn into_commit_ambiguous(mut self) -> Self {
        self.retry = false;
        self.rollback = false;
        self.raise = FinalErrorKind::CommitAmbiguous;
        self
    }

    /// Rebuild for a failure after the commit point: never raised, the
    /// runner reports success with `unstaging_complete = false`.
    pub(crate) fn into_post_commit(mut self) -> Self {
        self.retry = false;
        self.rollback = false;
        self.raise = FinalErrorKind::FailedPostCommit;
        self
    }

    /// Rebuild after the rollback itself failed: retrying would
    /// re-introduce conflicting staged state, so the failure becomes
    /// terminal with its raise kind and cause preserved.
    pub(crate) fn into_rollback_failed(mut self) -> Self {
        self.retry = false;
        self.rollback = false;
        self
    }
}

/// Map a raw store failure into a classified one.
pub(crate) fn classify(error: StoreError) -> OperationFailed {
    use FinalErrorKind::Failed;
    let template = match &error {
        StoreError::CasMismatch(_) => {
            OperationFailed::new(ErrorClass::CasMismatch, true, true, Failed)
        }
        StoreError::DocumentNotFound(_) => {
            OperationFailed::new(ErrorClass::DocNotFound, true, true, Failed)
        }
        StoreError::DocumentExists(_) => {
            OperationFailed::new(ErrorClass::DocAlreadyExists, true, true, Failed)
        }
        StoreError::Timeout | StoreError::TemporaryFailure => {
            OperationFailed::new(ErrorClass::Transient, true, true, Failed)
        }
        // An ATR document that can take no more entries; the next attempt
        // hashes onto a different ATR.
        StoreError::ValueTooLarge(_) => {
            OperationFailed::new(ErrorClass::AtrFull, true, true, Failed)
        }
        // Retryable where it happens during staging; the COMMITTED
        // transition rebuilds this into CommitAmbiguous.
        StoreError::DurabilityAmbiguous => {
            OperationFailed::new(ErrorClass::Ambiguous, true, true, Failed)
        }
        StoreError::PathNotFound(_) => {
            OperationFailed::new(ErrorClass::PathNotFound, false, true, Failed)
        }
        _ => OperationFailed::new(ErrorClass::Other, false, true, Failed),
    };
    template
        .with_detail(error.to_string())
        .with_cause(error)
}

/// Result type for operations inside an attempt.
pub type AttemptResult<T> = std::result::Result<T, OperationFailed>;

/// Terminal errors raised by the runner.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction failed")]
    Failed {
        #[source]
        cause: OperationFailed,
        result: TransactionResult,
    },

    #[error("transaction expired")]
    Expired {
        #[source]
        cause: OperationFailed,
        result: TransactionResult,
    },

    #[error("transaction commit outcome is ambiguous")]
    CommitAmbiguous {
        #[source]
        cause: OperationFailed,
        result: TransactionResult,
    },
}

impl TransactionError {
    /// The classified failure that terminated the run.
    pub fn cause(&self) -> &OperationFailed {
        match self {
            Self::Failed { cause, .. }
            | Self::Expired { cause, .. }
            | Self::CommitAmbiguous { cause, .. } => cause,
        }
    }

    /// The partial result of the terminated run.
    pub fn result(&self) -> &TransactionResult {
        match self {
            Self::Failed { result, .. }
            | Self::Expired { result, .. }
            | Self::CommitAmbiguous { result, .. } => result,
        }
    }
}

/// Result type for a transaction run.
pub type Result<T> = std::result::Result<T, TransactionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_table() {
        let cases = [
            (
                StoreError::CasMismatch("d".into()),
                ErrorClass::CasMismatch,
                true,
                true,
            ),
            (
                StoreError::DocumentNotFound("d".into()),
                ErrorClass::DocNotFound,
                true,
                true,
            ),
            (
                StoreError::DocumentExists("d".into()),
                ErrorClass::DocAlreadyExists,
                true,
                true,
            ),
            (StoreError::Timeout, ErrorClass::Transient, true, true),
            (
                StoreError::TemporaryFailure,
                ErrorClass::Transient,
                true,
                true,
            ),
            (
                StoreError::ValueTooLarge("atr".into()),
                ErrorClass::AtrFull,
                true,
                true,
            ),
            (
                StoreError::DurabilityAmbiguous,
                ErrorClass::Ambiguous,
                true,
                true,
            ),
            (
                StoreError::PathNotFound("p".into()),
                ErrorClass::PathNotFound,
                false,
                true,
            ),
            (
                StoreError::InvalidArgument("x".into()),
                ErrorClass::Other,
                false,
                true,
            ),
        ];

        for (error, class, retry, rollback) in cases {
            let classified = classify(error.clone());
            assert_eq!(classified.class(), class, "{error:?}");
            assert_eq!(classified.retry(), retry, "{error:?}");
            assert_eq!(classified.rollback(), rollback, "{error:?}");
            assert_eq!(classified.cause(), Some(&error));
        }
    }

    #[test]
    fn test_commit_ambiguous_rebuild_preserves_cause() {
        let rebuilt = classify(StoreError::DurabilityAmbiguous).into_commit_ambiguous();
        assert!(!rebuilt.retry());
        assert!(!rebuilt.rollback());
        assert_eq!(rebuilt.final_error(), FinalErrorKind::CommitAmbiguous);
        assert_eq!(rebuilt.cause(), Some(&StoreError::DurabilityAmbiguous));
    }

    #[test]
    fn test_rollback_failure_forces_terminal() {
        let failure = classify(StoreError::CasMismatch("d".into()));
        assert!(failure.retry());
        let rebuilt = failure.into_rollback_failed();
        assert!(!rebuilt.retry());
        assert!(!rebuilt.rollback());
        // raise and cause survive the rebuild
        assert_eq!(rebuilt.final_error(), FinalErrorKind::Failed);
        assert_eq!(rebuilt.cause(), Some(&StoreError::CasMismatch("d".into())));
    }

    #[test]
    fn test_expiry_is_final_without_rollback() {
        let expired = OperationFailed::expired("insert");
        assert_eq!(expired.class(), ErrorClass::Expiry);
        assert!(!expired.retry());
        assert!(!expired.rollback());
        assert_eq!(expired.final_error(), FinalErrorKind::Expired);
    }

    #[test]
    fn test_expired_from_preserves_cause() {
        let rebuilt = OperationFailed::expired_from(classify(StoreError::TemporaryFailure));
        assert_eq!(rebuilt.class(), ErrorClass::Expiry);
        assert_eq!(rebuilt.final_error(), FinalErrorKind::Expired);
        assert_eq!(rebuilt.cause(), Some(&StoreError::TemporaryFailure));
    }
}
