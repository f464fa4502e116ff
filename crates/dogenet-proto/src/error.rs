//! Protocol error types.

use thiserror::Error;

/// Errors arising from framing, decoding and signature checks.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Frame or payload failed structural validation.
    #[error("invalid frame: {0}")]
    BadFrame(String),

    /// Payload exceeds the protocol maximum.
    #[error("payload too large: {size} bytes, max {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Signature did not verify against the sender key.
    #[error("bad signature from {0}")]
    BadSignature(String),

    /// A public key was not a valid ed25519 point.
    #[error("invalid public key")]
    BadKey,

    /// An address string or record could not be parsed.
    #[error("invalid address: {0}")]
    BadAddress(String),

    /// I/O error surfaced through the codec.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
