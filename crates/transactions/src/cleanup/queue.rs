//! Bounded in-process queue of local cleanup work

use super::CleanupRequest;
use tokio::sync::mpsc;

pub(crate) fn channel(capacity: usize) -> (CleanupSender, mpsc::Receiver<CleanupRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CleanupSender { tx }, rx)
}

/// Producer half of the cleanup queue.
#[derive(Clone)]
pub(crate) struct CleanupSender {
    tx: mpsc::Sender<CleanupRequest>,
}

impl CleanupSender {
    /// Best-effort enqueue. Overflow drops the request: the client record
    /// manager rediscovers abandoned entries from the server side.
    pub fn offer(&self, request: CleanupRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                tracing::warn!(
                    atr_id = %request.atr_id,
                    attempt_id = %request.attempt_id,
                    "cleanup queue full, dropping request"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Draining is disabled or the client is shutting down.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::AtrState;

    fn request(n: usize) -> CleanupRequest {
        CleanupRequest {
            atr_id: format!("_txn:atr-{n}"),
            atr_collection: "_default".to_string(),
            attempt_id: format!("a{n}"),
            transaction_id: "t".to_string(),
            state: AtrState::Aborted,
            docs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_rather_than_blocks() {
        let (tx, mut rx) = channel(2);
        tx.offer(request(1));
        tx.offer(request(2));
        tx.offer(request(3)); // dropped

        assert_eq!(rx.recv().await.unwrap().attempt_id, "a1");
        assert_eq!(rx.recv().await.unwrap().attempt_id, "a2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_after_close_is_silent() {
        let (tx, rx) = channel(2);
        drop(rx);
        tx.offer(request(1));
    }
}
