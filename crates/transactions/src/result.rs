//! Transaction outcome

/// Outcome of a transaction run that terminated without raising.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    /// Identifier of the transaction.
    pub transaction_id: String,

    /// True only if every post-commit unstage completed. A false value
    /// after a successful return means the commit is durable and cleanup
    /// will finish applying it.
    pub unstaging_complete: bool,
}
