//! Handler-side cancellation controller.
//!
//! Tracks a cooperative cancellation token per in-flight call, keyed by
//! connection and correlation id (call ids are only unique per client
//! instance). A cancel notice marks the token; the handler decides whether
//! to observe it. Entries are dropped on call completion regardless of
//! whether they were ever cancelled.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::correlation::{ConnectionId, CorrelationId};
use crate::lock_ignore_poison;

pub(super) struct CancelMap {
    // ---
    tokens: Mutex<HashMap<(ConnectionId, CorrelationId), CancellationToken>>,
}

impl CancelMap {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and track the token for an arriving call.
    pub fn register(&self, connection: ConnectionId, id: CorrelationId) -> CancellationToken {
        // ---
        let token = CancellationToken::new();
        let mut tokens = lock_ignore_poison(&self.tokens);
        tokens.insert((connection, id), token.clone());
        token
    }

    /// Mark a call cancelled.
    ///
    /// Returns false if the call already completed and its entry was
    /// removed; the advisory notice is then a no-op.
    pub fn cancel(&self, connection: ConnectionId, id: &CorrelationId) -> bool {
        // ---
        let tokens = lock_ignore_poison(&self.tokens);
        match tokens.get(&(connection, id.clone())) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the entry for a completed call, cancelled or not.
    pub fn complete(&self, connection: ConnectionId, id: &CorrelationId) {
        // ---
        let mut tokens = lock_ignore_poison(&self.tokens);
        tokens.remove(&(connection, id.clone()));
    }
}
