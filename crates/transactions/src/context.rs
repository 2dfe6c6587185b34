//! Per-transaction context shared across attempts

use crate::config::TransactionsConfig;
use std::time::Instant;
use uuid::Uuid;

/// State owned by one call to the runner, living across all its attempts.
pub(crate) struct TransactionContext {
    transaction_id: String,
    start: Instant,
    config: TransactionsConfig,
}

impl TransactionContext {
    pub fn new(config: TransactionsConfig) -> Self {
        Self {
            transaction_id: Uuid::new_v4().to_string(),
            start: Instant::now(),
            config,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn config(&self) -> &TransactionsConfig {
        &self.config
    }

    /// Whether the transaction lifetime has elapsed. Checked at runner
    /// loop boundaries and on entry to each data operation.
    pub fn is_expired(&self) -> bool {
        self.start.elapsed() >= self.config.expiration_timeout
    }

    /// Lifetime in milliseconds, recorded into ATR entries so peers can
    /// judge abandonment.
    pub fn expires_ms(&self) -> u64 {
        self.config.expiration_timeout.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expiry_derivation() {
        let ctx = TransactionContext::new(
            TransactionsConfig::new().with_expiration_timeout(Duration::from_millis(5)),
        );
        assert!(!ctx.is_expired());
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctx.is_expired());
    }
}
