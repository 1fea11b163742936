//! Error types for the codec and for peer connections.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::handshake::PeerState;

/// Failures while framing or parsing a wire message.
///
/// Every variant means the byte stream can no longer be trusted; a [`Peer`]
/// that hits one maps it to [`PeerError::MalformedMessage`].
///
/// [`Peer`]: crate::peer::Peer
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid command name: {0}")]
    InvalidCommandName(String),

    #[error("Payload is too big: {size} bytes (max: {max})")]
    PayloadOverSizeLimit { size: usize, max: usize },

    #[error("Invalid network magic: expected {expected:02x?}, got {actual:02x?}")]
    BadMagic { expected: [u8; 4], actual: [u8; 4] },

    #[error("Checksum mismatch for '{command}'")]
    ChecksumMismatch { command: String },

    #[error("Malformed '{command}' payload: {reason}")]
    Malformed { command: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] io::Error),
}

/// Errors surfaced by a [`Peer`](crate::peer::Peer) or the
/// [`PeerGroup`](crate::peer_group::PeerGroup).
///
/// Cloneable so a single failure can be handed to every waiter on a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Framing or checksum failure, fatal to the connection.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The remote's version message failed a local requirement.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A message arrived that the current handshake stage does not accept.
    #[error("Protocol violation in state {state}: {message}")]
    ProtocolViolation { state: PeerState, message: String },

    /// The handshake did not complete before its deadline.
    #[error("Handshake timeout")]
    Timeout,

    /// The transport closed underneath the peer (EOF, reset, connect failure).
    #[error("Peer disconnected")]
    Disconnected,

    /// The peer was already closed or failed when the operation was attempted.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A connection to this address is already pending or established.
    #[error("Already connected to peer: {addr}")]
    AlreadyConnected { addr: SocketAddr },

    /// Application messages may only be sent once the peer is ready.
    #[error("Handshake not complete (state: {0})")]
    HandshakeIncomplete(PeerState),

    #[error("Maximum connections reached: {max}")]
    MaxConnectionsReached { max: usize },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<MessageError> for PeerError {
    fn from(err: MessageError) -> Self {
        PeerError::MalformedMessage(err.to_string())
    }
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> Self {
        PeerError::Transport(err.to_string())
    }
}

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;
