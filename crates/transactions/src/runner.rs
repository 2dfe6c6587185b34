//! Outer retry loop
//!
//! One call here is one transaction: a loop of attempts with exponential
//! backoff and jitter, gated on the transaction lifetime at each loop
//! boundary.

use crate::attempt::AttemptContext;
use crate::config::TransactionsConfig;
use crate::context::TransactionContext;
use crate::driver::AttemptDriver;
use crate::error::{AttemptResult, ErrorClass, FinalErrorKind, TransactionError};
use crate::result::TransactionResult;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const BACKOFF_CAP: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: u32 = 10;
/// Uniform jitter bound; decorrelates clients conflicting on the same
/// documents.
const JITTER_MS: u64 = 10;

fn next_backoff(current: Duration) -> Duration {
    (current * BACKOFF_FACTOR).min(BACKOFF_CAP)
}

pub(crate) async fn run_transaction<F, Fut>(
    driver: &AttemptDriver,
    config: TransactionsConfig,
    lambda: F,
) -> Result<TransactionResult, TransactionError>
where
    F: Fn(AttemptContext) -> Fut,
    Fut: Future<Output = AttemptResult<()>>,
{
    let overall = Arc::new(TransactionContext::new(config));
    let mut backoff = INITIAL_BACKOFF;
    let mut atr_salt = 0u64;

    loop {
        match driver.run_once(&lambda, &overall, atr_salt).await {
            Ok(summary) => {
                return Ok(TransactionResult {
                    transaction_id: overall.transaction_id().to_string(),
                    unstaging_complete: summary.unstaging_complete,
                });
            }
            Err(failure) => {
                if failure.class() == ErrorClass::AtrFull {
                    // Hash onto a different ATR next attempt.
                    atr_salt += 1;
                }
                if failure.retry() && !overall.is_expired() {
                    let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                    backoff = next_backoff(backoff);
                    continue;
                }

                let result = TransactionResult {
                    transaction_id: overall.transaction_id().to_string(),
                    unstaging_complete: false,
                };
                return match failure.final_error() {
                    // Commit is durable; cleanup finishes the unstaging.
                    // Reported as success, never raised.
                    FinalErrorKind::FailedPostCommit => Ok(result),
                    FinalErrorKind::Expired => Err(TransactionError::Expired {
                        cause: failure,
                        result,
                    }),
                    FinalErrorKind::CommitAmbiguous => Err(TransactionError::CommitAmbiguous {
                        cause: failure,
                        result,
                    }),
                    FinalErrorKind::Failed => Err(TransactionError::Failed {
                        cause: failure,
                        result,
                    }),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression_caps_at_100ms() {
        let mut backoff = INITIAL_BACKOFF;
        let mut observed = Vec::new();
        for _ in 0..5 {
            observed.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(
            observed,
            [
                Duration::from_millis(1),
                Duration::from_millis(10),
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
        // Non-decreasing throughout
        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    }
}
