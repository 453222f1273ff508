//! Subscription lifecycle manager.
//!
//! Owns the connection → subscription → release-token table. A release
//! token is owned by exactly one table entry at a time; taking it out (stop,
//! natural stream termination, or connection teardown — whichever happens
//! first) transfers ownership to the caller, and a later lookup for the same
//! id is a miss, which keeps every release a no-op the second time.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::correlation::{ConnectionId, SubscriptionId};
use crate::lock_ignore_poison;

pub(super) struct SubscriptionTable {
    // ---
    connections: Mutex<HashMap<ConnectionId, HashMap<SubscriptionId, CancellationToken>>>,
}

impl SubscriptionTable {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Track the release token for a started subscription.
    ///
    /// Returns false (leaving the table untouched) if the id is already
    /// live on this connection.
    pub fn insert(
        &self,
        connection: ConnectionId,
        id: SubscriptionId,
        release: CancellationToken,
    ) -> bool {
        // ---
        let mut connections = lock_ignore_poison(&self.connections);
        let table = connections.entry(connection).or_default();

        if table.contains_key(&id) {
            return false;
        }

        table.insert(id, release);
        true
    }

    /// Take the release token for one subscription.
    ///
    /// A miss means another path already released it (or it never existed).
    pub fn release(&self, connection: ConnectionId, id: &SubscriptionId) -> Option<CancellationToken> {
        // ---
        let mut connections = lock_ignore_poison(&self.connections);
        let table = connections.get_mut(&connection)?;

        let token = table.remove(id);
        if table.is_empty() {
            connections.remove(&connection);
        }

        token
    }

    /// Release every subscription owned by a connection.
    ///
    /// Returns how many were still registered.
    pub fn teardown(&self, connection: ConnectionId) -> usize {
        // ---
        let table = {
            let mut connections = lock_ignore_poison(&self.connections);
            connections.remove(&connection)
        };

        match table {
            Some(table) => {
                let count = table.len();
                for (_id, release) in table {
                    release.cancel();
                }
                count
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_release_transfers_ownership_once() {
        // ---
        let table = SubscriptionTable::new();
        let connection = ConnectionId(1);
        let id = SubscriptionId::generate();

        assert!(table.insert(connection, id.clone(), CancellationToken::new()));

        assert!(table.release(connection, &id).is_some());
        assert!(table.release(connection, &id).is_none());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        // ---
        let table = SubscriptionTable::new();
        let connection = ConnectionId(1);
        let id = SubscriptionId::generate();

        assert!(table.insert(connection, id.clone(), CancellationToken::new()));
        assert!(!table.insert(connection, id.clone(), CancellationToken::new()));

        // The original entry is still the live one.
        assert!(table.release(connection, &id).is_some());
    }

    #[test]
    fn test_teardown_sweeps_only_its_connection() {
        // ---
        let table = SubscriptionTable::new();

        let s1 = SubscriptionId::generate();
        let s2 = SubscriptionId::generate();
        let s3 = SubscriptionId::generate();

        let t1 = CancellationToken::new();
        let t2 = CancellationToken::new();
        let t3 = CancellationToken::new();

        table.insert(ConnectionId(1), s1, t1.clone());
        table.insert(ConnectionId(1), s2, t2.clone());
        table.insert(ConnectionId(2), s3.clone(), t3.clone());

        assert_eq!(table.teardown(ConnectionId(1)), 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert!(!t3.is_cancelled());

        // The other connection's subscription is still registered.
        assert!(table.release(ConnectionId(2), &s3).is_some());
        assert_eq!(table.teardown(ConnectionId(2)), 0);
    }
}
