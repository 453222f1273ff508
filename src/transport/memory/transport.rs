// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait using in-process data structures only.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics. Other transports are expected to approximate this behavior
//! as closely as their underlying systems allow and to document any
//! unavoidable deviations.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::{
    // ---
    Error,
    Invocation,
    InvokeHandle,
    NotifyHandle,
    Result,
    Transport,
    TransportBase,
    TransportPtr,
};

/// Inbox depth for served and listened channels.
const INBOX_CAPACITY: usize = 16;

/// One endpoint of an in-memory duplex link.
///
/// A link simulates the channel between a restricted UI context and a
/// privileged host process entirely within the process. It is intended for
/// testing and for validating higher-level behavior without introducing a
/// real IPC boundary.
///
/// ## Semantics
///
/// - Channel names match by exact string equality.
/// - Registrations take effect immediately; once `serve()`/`listen()`
///   returns, subsequent matching sends are deliverable.
/// - Messages on one channel arrive in send order.
/// - `invoke()` on a channel nobody serves is a channel error; `notify()`
///   on a channel nobody listens to is silently dropped.
/// - Dropping an endpoint fails subsequent operations on its peer.
///
/// ## Non-Goals
///
/// - Persistence or durability
/// - Failure injection or timing simulation
/// - Emulation of any specific OS IPC mechanism
struct MemoryEndpoint {
    // ---
    base: TransportBase,
    peer: OnceLock<Weak<MemoryEndpoint>>,
    invoke_handlers: RwLock<HashMap<String, mpsc::Sender<Invocation>>>,
    notify_listeners: RwLock<HashMap<String, mpsc::Sender<Bytes>>>,
}

impl MemoryEndpoint {
    // ---
    fn new(endpoint_id: &str) -> Self {
        // ---
        Self {
            base: TransportBase::new(endpoint_id),
            peer: OnceLock::new(),
            invoke_handlers: RwLock::new(HashMap::new()),
            notify_listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Upgrade the peer pointer, failing if the other endpoint is gone.
    fn peer(&self) -> Result<Arc<MemoryEndpoint>> {
        // ---
        self.peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::channel("peer endpoint is gone"))
    }
}

#[async_trait::async_trait]
impl Transport for MemoryEndpoint {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    /// Deliver an invocation to the peer's handler for this channel and
    /// await the single reply.
    async fn invoke(&self, channel: &str, message: Bytes) -> Result<Bytes> {
        // ---
        let peer = self.peer()?;

        let sender = {
            let handlers = peer.invoke_handlers.read().await;
            handlers.get(channel).cloned()
        };

        let sender = sender
            .ok_or_else(|| Error::channel(format!("no invoke handler for channel: {channel}")))?;

        let (tx, rx) = oneshot::channel();
        sender
            .send(Invocation { message, reply: tx })
            .await
            .map_err(|_| Error::channel(format!("invoke handler for {channel} shut down")))?;

        rx.await
            .map_err(|_| Error::channel("peer dropped the invocation without replying"))
    }

    /// Deliver a one-way message to the peer's listener for this channel.
    ///
    /// A missing or already-dropped listener discards the message; that is
    /// the reference semantics for fire-and-forget delivery.
    async fn notify(&self, channel: &str, message: Bytes) -> Result<()> {
        // ---
        let peer = self.peer()?;

        let sender = {
            let listeners = peer.notify_listeners.read().await;
            listeners.get(channel).cloned()
        };

        if let Some(sender) = sender {
            let _ = sender.send(message).await;
        }

        Ok(())
    }

    /// Register this endpoint as the invoke handler for a channel.
    ///
    /// Exactly one handler may serve a channel at a time, matching the
    /// one-reply contract of `invoke()`.
    async fn serve(&self, channel: &str) -> Result<InvokeHandle> {
        // ---
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        let mut handlers = self.invoke_handlers.write().await;
        if handlers.contains_key(channel) {
            return Err(Error::channel(format!(
                "invoke handler already registered for channel: {channel}"
            )));
        }
        handlers.insert(channel.to_string(), tx);

        Ok(InvokeHandle { inbox: rx })
    }

    /// Register this endpoint as the notify listener for a channel.
    async fn listen(&self, channel: &str) -> Result<NotifyHandle> {
        // ---
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        let mut listeners = self.notify_listeners.write().await;
        if listeners.contains_key(channel) {
            return Err(Error::channel(format!(
                "listener already registered for channel: {channel}"
            )));
        }
        listeners.insert(channel.to_string(), tx);

        Ok(NotifyHandle { inbox: rx })
    }

    /// Close this endpoint.
    ///
    /// Clears all registrations, which ends every receive loop draining an
    /// inbox from this endpoint.
    async fn close(&self) -> Result<()> {
        // ---
        self.invoke_handlers.write().await.clear();
        self.notify_listeners.write().await.clear();
        Ok(())
    }
}

/// Create a linked pair of in-memory endpoints.
///
/// The first endpoint plays the caller side and the second the handler
/// side, but the link is symmetric; either end may serve, listen, invoke,
/// and notify.
pub async fn create_link(a_id: &str, b_id: &str) -> Result<(TransportPtr, TransportPtr)> {
    // ---
    let a = Arc::new(MemoryEndpoint::new(a_id));
    let b = Arc::new(MemoryEndpoint::new(b_id));

    // Fresh OnceLocks; set() cannot fail here.
    let _ = a.peer.set(Arc::downgrade(&b));
    let _ = b.peer.set(Arc::downgrade(&a));

    let a: TransportPtr = a;
    let b: TransportPtr = b;
    Ok((a, b))
}
