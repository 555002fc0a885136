// =============================================================================
// Error kinds callers need to branch on
// =============================================================================
//
// Plumbing errors travel as `anyhow::Error`. The enums below exist where the
// caller reacts differently per kind: the feed restart loop, and the stream
// API mapping to HTTP status codes.
// =============================================================================

use thiserror::Error;

/// Failures inside one exchange feed session.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Dial, read or write failure, or the venue closed the socket.
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame or a value inside it did not match the expected schema.
    #[error("decode error: {0}")]
    Decode(String),

    /// The handshake response carried no session identifier.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl FeedError {
    /// Whether the error ends the current session, handing it to the restart
    /// loop. The read loop skips the offending value for anything else.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Auth(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Failures surfaced by the candle stream API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("invalid token for stream {0}")]
    Unauthorized(String),
}
