// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level channel interface used by the client
//! and server layers to exchange messages. It intentionally avoids any
//! reference to a concrete IPC mechanism.
//!
//! A transport is a duplex link between exactly two endpoints offering two
//! primitives, each addressed by a channel name:
//!
//! - **invoke** — send a named message and receive exactly one asynchronous
//!   reply
//! - **notify** — fire-and-forget one-way message
//!
//! The transport delivers opaque byte payloads only. Higher-level semantics
//! such as correlation, cancellation, and subscription lifecycle are handled
//! elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::Result;

/// Shared base state for all transport implementations.
///
/// Embeds common fields so that default `Transport` trait implementations
/// can delegate to this struct rather than repeating logic in each transport.
pub struct TransportBase {
    /// Identifies this endpoint of the link (used for logging only).
    pub endpoint_id: String,
}

impl TransportBase {
    /// Create a new TransportBase.
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
        }
    }
}

/// One incoming `invoke` awaiting its reply.
///
/// The receiving side must send exactly one reply through `reply`; dropping
/// it without replying surfaces as a channel error to the invoking side.
pub struct Invocation {
    // ---
    /// Opaque message bytes as sent by the peer.
    pub message: Bytes,

    /// Single-use reply slot for this invocation.
    pub reply: oneshot::Sender<Bytes>,
}

/// Handle returned from a successful `serve()` registration.
///
/// The registration remains active until the handle is dropped or the
/// transport is closed.
pub struct InvokeHandle {
    // ---
    /// Receiver channel for incoming invocations on the served channel.
    pub inbox: mpsc::Receiver<Invocation>,
}

/// Handle returned from a successful `listen()` registration.
pub struct NotifyHandle {
    // ---
    /// Receiver channel for one-way messages on the listened channel.
    pub inbox: mpsc::Receiver<Bytes>,
}

/// Transport abstraction.
///
/// A `Transport` provides best-effort delivery of opaque messages between
/// the two ends of a duplex link, with stronger semantics provided by higher
/// layers. Implementations must ensure that:
///
/// - Once `serve()`/`listen()` returns successfully, messages sent *after*
///   that point on the matching channel are deliverable.
/// - Messages on the same channel are delivered in send order; no ordering
///   is promised across distinct channels.
/// - `invoke()` resolves with exactly one reply, or fails with a channel
///   error if the peer cannot produce one.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    ///
    /// Required method - each concrete transport must implement this
    /// by returning `&self.base`.
    fn base(&self) -> &TransportBase;

    /// Returns the endpoint id of this side of the link.
    ///
    /// Default implementation delegates to `base()`.
    fn endpoint_id(&self) -> &str {
        &self.base().endpoint_id
    }

    /// Send a named message to the peer and await its single reply.
    async fn invoke(&self, channel: &str, message: Bytes) -> Result<Bytes>;

    /// Send a named one-way message to the peer.
    ///
    /// Delivery is fire-and-forget: a peer without a listener on `channel`
    /// silently discards the message.
    async fn notify(&self, channel: &str, message: Bytes) -> Result<()>;

    /// Register this endpoint as the handler for `invoke`s on a channel.
    async fn serve(&self, channel: &str) -> Result<InvokeHandle>;

    /// Register this endpoint as the listener for `notify`s on a channel.
    async fn listen(&self, channel: &str) -> Result<NotifyHandle>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying link
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;
