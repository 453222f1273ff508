/// Protocol types for the multiplexing bridge
///
/// This module defines the wire format for call, cancellation, and
/// subscription messages, plus the channel names they travel on.
mod message;

pub use message::{
    //
    CallKind,
    CallOutcome,
    CallRequest,
    CallResponse,
    CancelNotice,
    EventKind,
    SubscriptionEvent,
    SubscriptionStart,
    SubscriptionStop,
};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Channel names used by one bridge instance.
///
/// Derived from the configured prefix so several bridges can share a single
/// transport namespace without cross-talk.
#[derive(Debug, Clone)]
pub struct Channels {
    // ---
    /// Request/response channel (`invoke` primitive).
    pub call: String,
    /// Cancellation notices (one-way).
    pub cancel: String,
    /// Subscription start requests (one-way).
    pub sub_start: String,
    /// Subscription stop requests (one-way).
    pub sub_stop: String,
    /// Subscription events, handler → caller (one-way).
    pub sub_event: String,
}

impl Channels {
    /// Derive the channel set for a prefix.
    pub fn with_prefix(prefix: &str) -> Self {
        // ---
        Self {
            call: format!("{prefix}:call"),
            cancel: format!("{prefix}:cancel"),
            sub_start: format!("{prefix}:sub:start"),
            sub_stop: format!("{prefix}:sub:stop"),
            sub_event: format!("{prefix}:sub:event"),
        }
    }
}

/// Serialize a protocol message for the transport.
pub(crate) fn to_wire<T: Serialize>(msg: &T) -> Result<Bytes> {
    // ---
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

/// Parse a protocol message received from the transport.
pub(crate) fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    // ---
    Ok(serde_json::from_slice(bytes)?)
}
