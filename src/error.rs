//! Error types for the zerolink protocol stack.

use std::io;
use thiserror::Error;

use crate::peer::PeerId;
use crate::session::SessionId;

/// Errors that can occur in discovery, framing, handshakes and sessions.
#[derive(Debug, Error)]
pub enum ZerolinkError {
    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A length prefix exceeded the configured frame limit.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// The buffer ended before a field could be read.
    #[error("truncated message: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },

    /// A field was present but not well-formed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Tag byte did not name a known message type.
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    /// The remote closed the stream before the handshake completed.
    #[error("connection closed during handshake with {addr}")]
    HandshakeClosed { addr: String },

    /// The remote answered the handshake with something other than a ServiceResponse.
    #[error("unexpected {got} during handshake, wanted {wanted}")]
    UnexpectedMessage {
        wanted: &'static str,
        got: &'static str,
    },

    /// Handshake did not complete in time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A session id collided with a live entry.
    #[error("session {0} already exists")]
    DuplicateSession(SessionId),

    /// No address is known for the peer/service pair.
    #[error("no address known for service {service} on peer {peer}")]
    Unresolved { peer: PeerId, service: String },

    /// Routed delivery requested but no relay is configured.
    #[error("routed mode active but no relay address configured")]
    NoRelay,

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Identity or other local state could not be persisted.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for zerolink operations.
pub type Result<T> = std::result::Result<T, ZerolinkError>;
