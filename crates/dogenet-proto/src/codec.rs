//! Signed gossip message framing.
//!
//! Every DogeNet message travels as a fixed header followed by a payload:
//!
//! ```text
//! +---------+---------+----------+-----------+----------+
//! | Channel |   Tag   |  PubKey  | Signature |  Length  |
//! | 4 bytes | 4 bytes | 32 bytes |  64 bytes | 4 bytes  |
//! +---------+---------+----------+-----------+----------+
//! |                  Payload (Length bytes)             |
//! +------------------------------------------------------+
//! ```
//!
//! The signature covers channel ‖ tag ‖ payload, so a stored
//! (payload, signature) pair can be re-framed without re-signing.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::keys::{verify, KeyPair, PubKey};
use crate::{ProtoError, Tag4CC};

/// Fixed header size: channel (4) + tag (4) + pubkey (32) + sig (64) + length (4).
pub const HEADER_SIZE: usize = 108;

/// Maximum payload size accepted on the wire.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// A decoded, signature-checked message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Tag4CC,
    pub tag: Tag4CC,
    pub pubkey: PubKey,
    pub signature: [u8; 64],
    pub payload: Vec<u8>,
}

impl Message {
    /// Re-frame as a [`RawMessage`] for forwarding, without re-signing.
    pub fn to_raw(&self) -> RawMessage {
        RawMessage {
            header: reencode_header(
                self.channel,
                self.tag,
                &self.pubkey,
                &self.signature,
                &self.payload,
            ),
            payload: self.payload.clone(),
        }
    }
}

/// A pre-encoded message: header bytes plus payload bytes, ready to
/// write to any number of connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// All bytes of the frame in wire order.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.payload.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Bytes the signature covers for a message on `channel`/`tag`.
fn signed_bytes(channel: Tag4CC, tag: Tag4CC, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&channel.to_bytes());
    buf.extend_from_slice(&tag.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Sign `payload` with `keys` and frame it.
pub fn encode_message(
    channel: Tag4CC,
    tag: Tag4CC,
    keys: &KeyPair,
    payload: Vec<u8>,
) -> RawMessage {
    let sig = keys.sign(&signed_bytes(channel, tag, &payload));
    let header = reencode_header(channel, tag, &keys.public(), &sig, &payload);
    RawMessage { header, payload }
}

/// Rebuild a header around an existing signature (announcement reuse).
pub fn reencode_header(
    channel: Tag4CC,
    tag: Tag4CC,
    pubkey: &PubKey,
    sig: &[u8; 64],
    payload: &[u8],
) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&channel.to_bytes());
    header.extend_from_slice(&tag.to_bytes());
    header.extend_from_slice(pubkey);
    header.extend_from_slice(sig);
    header.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    header
}

/// Message codec for framed peer and handler connections.
///
/// Decoding verifies the signature; a frame that fails the check is a
/// protocol error and the caller is expected to drop the connection.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[104], src[105], src[106], src[107]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                size: length,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let channel = Tag4CC::new([src[0], src[1], src[2], src[3]]);
        let tag = Tag4CC::new([src[4], src[5], src[6], src[7]]);
        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&src[8..40]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&src[40..104]);

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).to_vec();

        verify(&pubkey, &signed_bytes(channel, tag, &payload), &signature)?;

        Ok(Some(Message {
            channel,
            tag,
            pubkey,
            signature,
            payload,
        }))
    }
}

impl Encoder<RawMessage> for MessageCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.header.len() != HEADER_SIZE {
            return Err(ProtoError::BadFrame(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                item.header.len()
            )));
        }
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                size: item.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        dst.reserve(item.header.len() + item.payload.len());
        dst.put_slice(&item.header);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
