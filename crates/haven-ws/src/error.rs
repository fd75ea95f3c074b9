//! Error types for the wire client

use thiserror::Error;

/// Result type for wire client operations
pub type WsResult<T> = Result<T, WsError>;

/// Errors surfaced by the wire client
#[derive(Debug, Error)]
pub enum WsError {
    /// The session is down. Returned by every call between a transport
    /// failure and the next successful connect.
    #[error("not connected to upstream")]
    NotConnected,

    /// Socket-level failure. Tears down the session.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The upstream rejected our access token
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A frame we could not make sense of
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A result frame with success=false
    #[error("command rejected by upstream: {message}")]
    CommandFailed { message: String },

    /// The upstream did not answer within the handshake/request window
    #[error("timed out waiting for upstream")]
    Timeout,
}

impl WsError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, WsError::NotConnected)
    }
}
