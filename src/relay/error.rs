//! Error taxonomy for a relayed call.
//!
//! Every variant maps to one of four outcomes: fatal at session start
//! (`Connect`, `Handshake`), fatal mid-session (transport closed or a send
//! failed, protocol mismatch), or recoverable (`InvalidPayload`, logged and
//! skipped by the pump that hit it).

/// Errors raised by the relay core.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The upstream WebSocket could not be opened (DNS, TLS, auth rejected).
    #[error("failed to connect to realtime service: {0}")]
    Connect(String),

    /// The socket opened but the session was never acknowledged.
    #[error("realtime session handshake failed: {0}")]
    Handshake(String),

    /// The upstream sent an event that belongs to a different protocol schema.
    #[error("realtime protocol mismatch: received `{event_type}` while speaking {expected}")]
    ProtocolMismatch {
        event_type: String,
        expected: &'static str,
    },

    /// The telephony side went away before the session could finish.
    #[error("telephony stream closed: {0}")]
    TelephonyClosed(String),

    /// Writing a frame to the telephony side failed.
    #[error("failed to send to telephony stream: {0}")]
    TelephonySend(String),

    /// Writing an intent to the conversation side failed.
    #[error("failed to send to realtime service: {0}")]
    ConversationSend(String),

    /// A frame or message could not be decoded. Never fatal.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl RelayError {
    /// Whether the session must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidPayload(_))
    }
}

/// Result alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
