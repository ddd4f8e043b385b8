//! # Error Types
//!
//! Error handling for the client engine.
//!
//! The taxonomy separates three classes of failure:
//! - **Caller errors** (`UnsupportedCommand`, `FieldOutOfRange`, `UnknownPeer`,
//!   `InvalidState`): surfaced synchronously from `encode`/`send`.
//! - **Connection-fatal conditions** (`PeerUnresponsive`, `AuthenticationFailed`):
//!   drive the peer to `Disconnecting` and are surfaced as a `Disconnected`
//!   event, never as a panic.
//! - **Transport anomalies** (loss, duplication, reordering, fragmentation
//!   gaps): recovered inside the reliability layer and never surfaced. A
//!   `DuplicateOrStalePacket` is dropped silently.
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The wire bytes could not be decoded: a length prefix overran the
    /// buffer or a required field was truncated. The offending packet is
    /// dropped; the connection survives unless this recurs.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Encode was asked for a command the schema table does not know.
    #[error("Unsupported command: 0x{0:04x}")]
    UnsupportedCommand(u16),

    /// A field value violates its declared wire width or bounds.
    #[error("Field '{field}' out of range for its wire type")]
    FieldOutOfRange { field: &'static str },

    /// A sequence number already seen inside the dedup window. Internal;
    /// callers never observe this as a failure.
    #[error("Duplicate or stale packet")]
    DuplicateOrStalePacket,

    /// Retry ceiling exceeded for a reliable send with no acknowledgment.
    #[error("Peer unresponsive (retry ceiling exceeded)")]
    PeerUnresponsive,

    /// The login handshake was rejected or a proof failed validation.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Cooperative shutdown was requested; poll returned promptly.
    #[error("Cancelled")]
    Cancelled,

    /// The handshake negotiated no mutually supported version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// Operation attempted on a peer id that is not registered (or already
    /// closed and removed).
    #[error("Unknown peer")]
    UnknownPeer,

    /// Operation not valid in the peer's current connection state.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
