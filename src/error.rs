use thiserror::Error;

/// Errors that can occur on either side of the bridge
#[derive(Error, Debug)]
pub enum Error {
    /// No handler is registered for the requested path
    #[error("no handler registered for path: {0}")]
    NotFound(String),

    /// The call was cancelled before a response was delivered
    #[error("call cancelled")]
    Cancelled,

    /// The remote handler failed; carries a description only, never the
    /// original error value
    #[error("handler failed: {0}")]
    Handler(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying channel failed to deliver a message
    #[error("channel error: {0}")]
    Channel(String),
}

impl Error {
    /// Build a `Channel` error from anything displayable.
    pub(crate) fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;
