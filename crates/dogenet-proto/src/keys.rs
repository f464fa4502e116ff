//! Node and identity keys.
//!
//! A node's transport identity and its owner's long-term identity are
//! both ed25519 keys; only the node key ever signs gossip messages here.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::ProtoError;

/// A 32-byte ed25519 public key (node or identity).
pub type PubKey = [u8; 32];

/// An ed25519 keypair identifying this node on the overlay.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from the 64-byte private‖public form emitted by
    /// `genkey`.
    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let raw: &[u8; 64] = bytes.try_into().map_err(|_| ProtoError::BadKey)?;
        let signing = SigningKey::from_keypair_bytes(raw).map_err(|_| ProtoError::BadKey)?;
        Ok(Self { signing })
    }

    /// The 64-byte private‖public form.
    pub fn to_keypair_bytes(&self) -> [u8; 64] {
        self.signing.to_keypair_bytes()
    }

    /// The public half.
    pub fn public(&self) -> PubKey {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a message, returning the 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", hex::encode(self.public()))
    }
}

/// Verify `sig` over `data` against `pubkey`.
pub fn verify(pubkey: &PubKey, data: &[u8], sig: &[u8; 64]) -> Result<(), ProtoError> {
    let key = VerifyingKey::from_bytes(pubkey).map_err(|_| ProtoError::BadKey)?;
    let sig = Signature::from_bytes(sig);
    key.verify(data, &sig)
        .map_err(|_| ProtoError::BadSignature(hex::encode(pubkey)))
}
