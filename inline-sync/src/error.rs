//! Error types for the realtime sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a connection handshake did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The server refused the credentials.
    #[error("credentials rejected: {0}")]
    AuthRejected(String),

    /// The server does not speak our protocol version.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// No confirmation arrived in time.
    #[error("handshake timed out")]
    Timeout,

    /// There was no token to present.
    #[error("no credentials available")]
    MissingCredentials,

    /// The transport closed before the handshake completed.
    #[error("connection closed during handshake: {0}")]
    Closed(String),
}

impl HandshakeError {
    /// Whether a fresh token could fix this failure.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::MissingCredentials)
    }
}

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The transport failed to open, send or stay open.
    #[error("transport error: {0}")]
    Transport(String),

    /// The handshake was refused or never completed.
    #[error("handshake failed: {0}")]
    HandshakeRejected(#[from] HandshakeError),

    /// An RPC got no answer within its deadline.
    #[error("rpc timed out")]
    RpcTimeout,

    /// The server answered an RPC with an error.
    #[error("{friendly}")]
    Rpc {
        code: i32,
        error_code: i32,
        message: String,
        friendly: String,
    },

    /// The server broke a protocol invariant (e.g. a slice that does not advance).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The bucket state store failed.
    #[error("storage error: {0}")]
    Store(String),

    /// The data store refused an update.
    #[error("apply error: {0}")]
    Apply(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No open session to run the request on.
    #[error("not connected")]
    NotConnected,

    /// The work belonged to a superseded connection generation.
    #[error("cancelled by a newer connection")]
    Cancelled,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Builds an RPC error with a human readable label for the server's error code.
    pub fn rpc(code: i32, error_code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        let friendly = format_rpc_error(error_code, &message, code);
        Self::Rpc {
            code,
            error_code,
            message,
            friendly,
        }
    }

    /// Whether retrying on the next connection could succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Serialization(_) | Self::ProtocolViolation(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

fn format_rpc_error(error_code: i32, message: &str, status_code: i32) -> String {
    let label = match error_code {
        1 => "Bad request",
        2 => "Not authenticated",
        3 => "Rate limited",
        4 => "Internal server error",
        5 => "Invalid peer (chat/user id)",
        6 => "Invalid message id",
        7 => "Invalid user id",
        8 => "User already in chat/space",
        9 => "Invalid space id",
        10 => "Invalid chat id",
        11 => "Invalid email address",
        12 => "Invalid phone number",
        13 => "Space admin required",
        14 => "Space owner required",
        _ => "Unknown RPC error",
    };

    let mut formatted = String::from(label);
    if !message.is_empty() && !message.eq_ignore_ascii_case(label) {
        formatted.push_str(": ");
        formatted.push_str(message);
    }
    if status_code != 0 {
        formatted.push_str(&format!(" (HTTP {status_code})"));
    }
    formatted
}
