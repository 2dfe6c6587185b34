//! Error types for store operations

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors a store operation can fail with.
///
/// These model the production cluster's failure surface; the transactions
/// classifier maps them into its own taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document already exists: {0}")]
    DocumentExists(String),

    #[error("CAS mismatch on document: {0}")]
    CasMismatch(String),

    #[error("subdocument path not found: {0}")]
    PathNotFound(String),

    #[error("subdocument path already exists: {0}")]
    PathExists(String),

    #[error("too many subdocument specs: {0} (limit 16)")]
    TooManySpecs(usize),

    #[error("value too large for document: {0}")]
    ValueTooLarge(String),

    #[error("operation timed out")]
    Timeout,

    #[error("temporary failure, retry later")]
    TemporaryFailure,

    #[error("durability requirement outcome is ambiguous")]
    DurabilityAmbiguous,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
