//! # dogenet-proto
//!
//! Wire-level building blocks for the DogeNet gossip overlay:
//!
//! - [`Tag4CC`] — 4-character channel/message tags
//! - [`Address`] — 16-byte host + port, with the fixed 18-byte key form
//! - [`KeyPair`] / [`PubKey`] — ed25519 node and identity keys
//! - [`MessageCodec`] — signed message framing for `tokio_util::codec::Framed`
//! - [`AddressMsg`] — the `node`/`Addr` announcement payload

mod address;
mod announce;
mod codec;
mod error;
mod keys;
mod tag;

pub use address::Address;
pub use announce::{doge_to_unix, unix_to_doge, AddressMsg, Service, ADDR_MSG_MIN_SIZE};
pub use codec::{
    encode_message, reencode_header, Message, MessageCodec, RawMessage, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use error::ProtoError;
pub use keys::{verify, KeyPair, PubKey};
pub use tag::Tag4CC;

/// Default TCP port for DogeNet gossip.
pub const DOGENET_DEFAULT_PORT: u16 = 42069;

/// Default TCP port for Dogecoin Core nodes.
pub const CORE_NODE_DEFAULT_PORT: u16 = 22556;

/// The channel carrying node metadata (announcements).
pub const CHANNEL_NODE: Tag4CC = Tag4CC::new(*b"node");

/// Message tag for announcements on [`CHANNEL_NODE`].
pub const TAG_ADDRESS: Tag4CC = Tag4CC::new(*b"Addr");

/// Service tag advertising a co-located Dogecoin Core node.
pub const SERVICE_CORE: Tag4CC = Tag4CC::new(*b"Core");
