//! Session error types. Per-connection errors never propagate past the
//! session that hit them; they close that connection and nothing else.

use thiserror::Error;

use dogenet_proto::ProtoError;

/// Reasons a peer or handler session ends.
#[derive(Error, Debug)]
pub enum NetError {
    /// Bad frame, bad signature or other protocol violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    /// Socket-level read/write failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An outbound dial reached a node with the wrong key.
    #[error("peer key mismatch: expected {expected}, got {got}")]
    WrongPeer { expected: String, got: String },

    /// A live session already exists for this node key.
    #[error("already connected to peer {0}")]
    DuplicatePeer(String),

    /// The peer did not complete the announcement exchange in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The remote side closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// The service is shutting down.
    #[error("service stopping")]
    Stopping,
}
