//! Public, transport-agnostic bridge configuration.
//!
//! This type intentionally contains no transport-specific concepts.
//! Transport layers are responsible for interpreting delivery concerns;
//! the config only shapes how the protocol addresses its channels.

use crate::protocol::Channels;

/// Default channel-name prefix.
pub const DEFAULT_CHANNEL_PREFIX: &str = "rpc";

/// Bridge configuration shared by the client and server sides.
///
/// Both sides of one bridge must be built from configs with the same
/// channel prefix; distinct prefixes let several bridges coexist on one
/// transport namespace without cross-talk.
///
/// # Example
///
/// ```
/// use mux_rpc::RpcConfig;
///
/// let config = RpcConfig::default().with_channel_prefix("settings-ui");
/// ```
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Prefix for every channel name this bridge uses.
    pub channel_prefix: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

impl RpcConfig {
    // ---
    /// Set the channel-name prefix.
    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Derive the concrete channel names for this config.
    pub(crate) fn channels(&self) -> Channels {
        Channels::with_prefix(&self.channel_prefix)
    }
}
