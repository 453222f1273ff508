//! RPC semantics over a single duplex IPC channel with automatic
//! request/response correlation and subscription multiplexing
//!
//! This library bridges two isolated execution contexts — a privileged host
//! process and a restricted UI-side context that cannot call the host
//! directly — so the UI side can invoke host-side procedures and consume
//! host-side event streams as if they were local. It handles correlation ID
//! generation, request/response matching, cooperative cancellation, and
//! per-connection subscription lifecycles.
//!

// Import all sub modules once...
mod client;
mod domain;
mod server;
mod transport;

mod rpc_config;

mod correlation;
mod envelope;
mod error;
mod macros;
mod protocol;

use std::sync::{Mutex, MutexGuard};

#[allow(unused_imports)]
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{ClientSubscription, RpcClient};
pub use server::{CallContext, Router, RouterBuilder, RpcServer};

pub use rpc_config::RpcConfig;

pub use correlation::{ConnectionId, CorrelationId, SubscriptionId};
pub use envelope::Payload;
pub use error::{Error, Result};

// Cancellation signals are part of the public call surface.
pub use tokio_util::sync::CancellationToken;

pub use transport::create_memory_link;

// --- public re-exports
pub use domain::{
    //
    Invocation,
    InvokeHandle,
    NotifyHandle,
    Transport,
    TransportBase,
    TransportPtr,
};

pub use protocol::{
    //
    CallKind,
    CallOutcome,
    CallRequest,
    CallResponse,
    CancelNotice,
    Channels,
    EventKind,
    SubscriptionEvent,
    SubscriptionStart,
    SubscriptionStop,
};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The protected state throughout this crate is a best-effort
/// registry (id → waiter, id → observer, id → release token).
///
/// Ignoring poisoning is acceptable because:
/// - There are no invariants spanning multiple fields.
/// - The worst outcome is a dropped or unmatched message.
/// - Link-level failures are handled by the transport layer.
///
/// This avoids propagating non-`Send` poison errors across async boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
