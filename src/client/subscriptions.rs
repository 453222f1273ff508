//! Caller-side subscription registry and the public subscription handle.
//!
//! The registry maps a subscription id to the *one* observer currently
//! attached to it. The shared event listener demultiplexes every incoming
//! event by id through [`SubscriptionRegistry::dispatch`]; an id with no
//! observer silently discards the event (already unsubscribed or already
//! finished).

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::correlation::SubscriptionId;
use crate::protocol::{EventKind, SubscriptionEvent};
use crate::{log_debug, Error, Result};

use super::RpcClient;

/// Maps a subscription id to its single observer.
pub(super) struct SubscriptionRegistry {
    // ---
    observers: HashMap<SubscriptionId, mpsc::UnboundedSender<EventKind>>,
}

impl SubscriptionRegistry {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            observers: HashMap::new(),
        }
    }

    /// Attach the observer for a fresh subscription id.
    pub fn register(&mut self, id: SubscriptionId) -> mpsc::UnboundedReceiver<EventKind> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.insert(id, tx);
        rx
    }

    /// Detach the observer for an id.
    ///
    /// Returns true if an observer was still attached.
    pub fn remove(&mut self, id: &SubscriptionId) -> bool {
        // ---
        self.observers.remove(id).is_some()
    }

    /// Route one incoming event to its observer.
    ///
    /// A terminal event (error or complete) removes the observer *before*
    /// delivery, so at most one terminal event ever reaches it even if the
    /// producer keeps emitting.
    pub fn dispatch(&mut self, event: SubscriptionEvent) {
        // ---
        match event.kind {
            EventKind::Data { .. } => {
                if let Some(tx) = self.observers.get(&event.id) {
                    if tx.send(event.kind).is_err() {
                        // Handle dropped without unsubscribing; detach now.
                        self.observers.remove(&event.id);
                    }
                }
            }
            terminal => {
                if let Some(tx) = self.observers.remove(&event.id) {
                    let _ = tx.send(terminal);
                }
            }
        }
    }

    /// Number of live observers.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// Live subscription on the caller side.
///
/// Yields decoded items in issuance order via [`next`](Self::next). Exactly
/// one terminal outcome is ever observed: an error item, end-of-stream after
/// completion, or local detach via [`unsubscribe`](Self::unsubscribe).
///
/// Dropping the handle without unsubscribing detaches the observer and sends
/// the stop notice best-effort in the background.
pub struct ClientSubscription<T> {
    // ---
    client: RpcClient,
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<EventKind>,
    /// No further protocol action needed (terminal seen or detached).
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ClientSubscription<T> {
    // ---
    pub(super) fn new(
        client: RpcClient,
        id: SubscriptionId,
        events: mpsc::UnboundedReceiver<EventKind>,
    ) -> Self {
        // ---
        Self {
            client,
            id,
            events,
            done: false,
            _marker: PhantomData,
        }
    }

    /// The id events for this subscription are tagged with.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Await the next event.
    ///
    /// Returns `Some(Ok(item))` for a data event, `Some(Err(..))` for the
    /// terminal error event, and `None` once the stream has completed or the
    /// observer was detached. After a terminal event every further call
    /// returns `None`.
    pub async fn next(&mut self) -> Option<Result<T>> {
        // ---
        if self.done {
            return None;
        }

        match self.events.recv().await {
            None => {
                // Observer detached (unsubscribe raced us) or client gone.
                self.done = true;
                None
            }
            Some(EventKind::Data { payload }) => Some(payload.decode_or_null()),
            Some(EventKind::Error { description }) => {
                self.done = true;
                Some(Err(Error::Handler(description)))
            }
            Some(EventKind::Complete) => {
                self.done = true;
                None
            }
        }
    }

    /// Detach the observer and tell the handler side to stop.
    ///
    /// Detaching is synchronous: events still in flight never reach this
    /// observer. The stop notice is best-effort; a delivery failure is
    /// swallowed since the caller has already detached. Calling this after
    /// the stream finished naturally is a no-op.
    pub async fn unsubscribe(mut self) {
        // ---
        if self.done {
            return;
        }
        self.done = true;

        self.client.detach_observer(&self.id);
        self.client.send_stop(&self.id).await;
    }
}

impl<T> Drop for ClientSubscription<T> {
    fn drop(&mut self) {
        // ---
        if self.done {
            return;
        }

        self.client.detach_observer(&self.id);
        log_debug!("subscription {} dropped without unsubscribing", self.id);
        self.client.spawn_stop(self.id.clone());
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::envelope::Payload;

    fn data_event(id: &SubscriptionId, value: i32) -> SubscriptionEvent {
        // ---
        SubscriptionEvent {
            id: id.clone(),
            kind: EventKind::Data {
                payload: Payload::encode(&value).unwrap(),
            },
        }
    }

    #[test]
    fn test_dispatch_routes_by_id() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        let id1 = SubscriptionId::generate();
        let id2 = SubscriptionId::generate();

        let mut rx1 = registry.register(id1.clone());
        let mut rx2 = registry.register(id2.clone());

        registry.dispatch(data_event(&id1, 1));
        registry.dispatch(data_event(&id2, 2));

        assert!(matches!(rx1.try_recv(), Ok(EventKind::Data { .. })));
        assert!(matches!(rx2.try_recv(), Ok(EventKind::Data { .. })));
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn test_terminal_event_detaches_before_delivery() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        let id = SubscriptionId::generate();
        let mut rx = registry.register(id.clone());

        registry.dispatch(SubscriptionEvent {
            id: id.clone(),
            kind: EventKind::Complete,
        });
        assert_eq!(registry.len(), 0);

        // Events after the terminal one are discarded, not delivered.
        registry.dispatch(data_event(&id, 3));

        assert!(matches!(rx.try_recv(), Ok(EventKind::Complete)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_unknown_id_is_discarded() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        registry.dispatch(data_event(&SubscriptionId::generate(), 9));
        assert_eq!(registry.len(), 0);
    }
}
