//! Cleanup of terminated and abandoned attempts
//!
//! Two feeds converge on the [`Cleaner`]: the local queue of this
//! client's own attempts, and the client record manager's sweep of ATR
//! partitions for attempts abandoned by dead peers.

mod cleaner;
mod client_record;
mod queue;

pub use cleaner::Cleaner;
pub use client_record::{ClientRecordManager, CLIENT_RECORD_ID};

pub(crate) use cleaner::spawn_drain;
pub(crate) use client_record::ClientRecordHandle;
pub(crate) use queue::{channel, CleanupSender};

use crate::repository::{AtrState, DocRecord, StagedOpKind};

/// Weak descriptor of a terminated attempt: coordinates only, never
/// references into live attempt state.
#[derive(Debug, Clone)]
pub struct CleanupRequest {
    pub atr_id: String,
    pub atr_collection: String,
    pub attempt_id: String,
    pub transaction_id: String,
    /// Attempt state at hand-off; the ATR entry re-read by the cleaner is
    /// authoritative.
    pub state: AtrState,
    pub docs: Vec<(StagedOpKind, DocRecord)>,
}
