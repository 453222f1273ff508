use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::correlation::CorrelationId;
use crate::envelope::Payload;
use crate::Result;

/// Tracks in-flight calls waiting for responses
///
/// Uses a HashMap to map correlation IDs to oneshot channels. When a
/// response (or a transport failure) arrives, the channel delivers the
/// settled outcome to the waiting Future.
///
/// Every entry is taken out of the map exactly once: by the response path,
/// by cancellation, or never (client dropped). A lookup miss means the
/// other path already consumed the entry and the message is discarded.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<CorrelationId, oneshot::Sender<Result<Payload>>>,
}

impl PendingCalls {
    // ---

    /// Create a new empty pending-call tracker
    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new pending call
    ///
    /// Returns a receiver that resolves when the call settles.
    pub fn register(&mut self, id: CorrelationId) -> oneshot::Receiver<Result<Payload>> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        rx
    }

    /// Settle a pending call with its outcome
    ///
    /// Returns true if the id was found and the outcome was delivered.
    pub fn complete(&mut self, id: &CorrelationId, outcome: Result<Payload>) -> bool {
        // ---
        if let Some(tx) = self.calls.remove(id) {
            // Ignore a dropped receiver; the caller has gone away.
            let _ = tx.send(outcome);
            true
        } else {
            false
        }
    }

    /// Remove a pending call without delivering an outcome
    ///
    /// Used by the cancellation path; the caller fails itself locally.
    pub fn remove(&mut self, id: &CorrelationId) -> bool {
        // ---
        self.calls.remove(id).is_some()
    }

    /// Get the number of in-flight calls
    pub fn len(&self) -> usize {
        // ---
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_register_and_complete() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let rx = pending.register(id.clone());
        assert_eq!(pending.len(), 1);

        let payload = Payload::encode(&"test response").unwrap();
        assert!(pending.complete(&id, Ok(payload.clone())));

        // Should be removed after completion
        assert_eq!(pending.len(), 0);

        // Receiver should get the settled outcome
        let received = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn test_remove() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let _rx = pending.register(id.clone());
        assert_eq!(pending.len(), 1);

        assert!(pending.remove(&id));
        assert_eq!(pending.len(), 0);

        // Second remove should return false
        assert!(!pending.remove(&id));
    }

    #[test]
    fn test_complete_unknown_id() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CorrelationId::generate();

        let payload = Payload::encode(&"test").unwrap();
        assert!(!pending.complete(&id, Ok(payload)));
    }
}
