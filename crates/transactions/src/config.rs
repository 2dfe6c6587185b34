//! Transactions configuration

use coral_store::DurabilityLevel;
use std::time::Duration;

/// Configuration for the transactions client.
#[derive(Debug, Clone)]
pub struct TransactionsConfig {
    /// Transaction lifetime; attempts stop retrying past this.
    pub expiration_timeout: Duration,

    /// Per-operation store timeout, forwarded on every repository call.
    pub key_value_timeout: Option<Duration>,

    /// Window over which lost-attempt cleanup sweeps all owned ATRs;
    /// also the base of each client's heartbeat lease.
    pub cleanup_window: Duration,

    /// Drain this client's own cleanup queue in the background.
    pub cleanup_client_attempts: bool,

    /// Run the client record manager to clean up attempts abandoned by
    /// dead peers.
    pub cleanup_lost_attempts: bool,

    /// Durability applied to all durable writes.
    pub durability_level: DurabilityLevel,

    /// Number of ATR documents the key space hashes onto.
    pub num_atrs: usize,

    /// Collection holding ATR documents and the client record.
    pub metadata_collection: String,

    /// Capacity of the local cleanup queue.
    pub cleanup_queue_capacity: usize,
}

impl Default for TransactionsConfig {
    fn default() -> Self {
        Self {
            expiration_timeout: Duration::from_secs(15),
            key_value_timeout: None,
            cleanup_window: Duration::from_secs(60),
            cleanup_client_attempts: true,
            cleanup_lost_attempts: true,
            durability_level: DurabilityLevel::Majority,
            num_atrs: 1024,
            metadata_collection: "_default".to_string(),
            cleanup_queue_capacity: 1024,
        }
    }
}

impl TransactionsConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transaction lifetime.
    pub fn with_expiration_timeout(mut self, timeout: Duration) -> Self {
        self.expiration_timeout = timeout;
        self
    }

    /// Set the per-operation store timeout.
    pub fn with_key_value_timeout(mut self, timeout: Duration) -> Self {
        self.key_value_timeout = Some(timeout);
        self
    }

    /// Set the cleanup heartbeat window.
    pub fn with_cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = window;
        self
    }

    /// Enable or disable draining the local cleanup queue.
    pub fn with_cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = enabled;
        self
    }

    /// Enable or disable the client record manager.
    pub fn with_cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_lost_attempts = enabled;
        self
    }

    /// Set the durability level for all durable writes.
    pub fn with_durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = level;
        self
    }

    /// Set the number of ATR documents.
    pub fn with_num_atrs(mut self, num_atrs: usize) -> Self {
        self.num_atrs = num_atrs;
        self
    }

    /// Set the metadata collection.
    pub fn with_metadata_collection(mut self, collection: impl Into<String>) -> Self {
        self.metadata_collection = collection.into();
        self
    }

    /// Apply per-transaction overrides on top of this config.
    pub(crate) fn apply(&self, overrides: &PerTransactionConfig) -> TransactionsConfig {
        let mut effective = self.clone();
        if let Some(timeout) = overrides.expiration_timeout {
            effective.expiration_timeout = timeout;
        }
        if let Some(timeout) = overrides.key_value_timeout {
            effective.key_value_timeout = Some(timeout);
        }
        if let Some(level) = overrides.durability_level {
            effective.durability_level = level;
        }
        effective
    }
}

/// Overrides applied to a single transaction.
#[derive(Debug, Clone, Default)]
pub struct PerTransactionConfig {
    pub expiration_timeout: Option<Duration>,
    pub key_value_timeout: Option<Duration>,
    pub durability_level: Option<DurabilityLevel>,
}

impl PerTransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiration_timeout(mut self, timeout: Duration) -> Self {
        self.expiration_timeout = Some(timeout);
        self
    }

    pub fn with_durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = Some(level);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_base() {
        let base = TransactionsConfig::new()
            .with_expiration_timeout(Duration::from_secs(30))
            .with_durability_level(DurabilityLevel::PersistToMajority);

        let effective = base.apply(
            &PerTransactionConfig::new().with_expiration_timeout(Duration::from_secs(5)),
        );

        assert_eq!(effective.expiration_timeout, Duration::from_secs(5));
        assert_eq!(
            effective.durability_level,
            DurabilityLevel::PersistToMajority
        );
    }
}
