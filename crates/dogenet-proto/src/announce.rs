//! The `node`/`Addr` announcement payload.
//!
//! Each node periodically gossips an [`AddressMsg`] describing its public
//! address, owner identity, subscribed channels and advertised services.
//! The encoding is position-fixed so equality of encodings is equality of
//! announcements (the store relies on byte-compare for change detection).

use crate::address::Address;
use crate::keys::PubKey;
use crate::{ProtoError, Tag4CC};

/// Protocol timestamps count seconds from the Dogecoin genesis block
/// (2013-12-06T10:25:40Z) and fit a u32 for the next ~120 years.
const PROTOCOL_EPOCH: i64 = 1_386_325_540;

/// Convert a unix timestamp to protocol time.
pub fn unix_to_doge(unix: i64) -> u32 {
    unix.saturating_sub(PROTOCOL_EPOCH).max(0) as u32
}

/// Convert protocol time back to a unix timestamp.
pub fn doge_to_unix(doge: u32) -> i64 {
    PROTOCOL_EPOCH + doge as i64
}

/// Fixed prefix: time (4) + address (16) + port (2) + owner (32) + counts (2).
pub const ADDR_MSG_MIN_SIZE: usize = 56;

/// A service advertised alongside the node (e.g. a co-located Core node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Service {
    pub tag: Tag4CC,
    pub port: u16,
}

/// The announcement body. Immutable once signed; `time` is the only
/// field the announcement loop rewrites between signings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressMsg {
    /// Protocol time of signing.
    pub time: u32,
    /// Public address of the announcing node.
    pub address: Address,
    /// Identity key of the node's owner.
    pub owner: PubKey,
    /// Channels this node subscribes to.
    pub channels: Vec<Tag4CC>,
    /// Services reachable at the node's host.
    pub services: Vec<Service>,
}

impl AddressMsg {
    /// Encode to the wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(ADDR_MSG_MIN_SIZE + self.channels.len() * 4 + self.services.len() * 6);
        out.extend_from_slice(&self.time.to_be_bytes());
        out.extend_from_slice(&self.address.host());
        out.extend_from_slice(&self.address.port().to_be_bytes());
        out.extend_from_slice(&self.owner);
        out.push(self.channels.len() as u8);
        out.push(self.services.len() as u8);
        for chan in &self.channels {
            out.extend_from_slice(&chan.to_bytes());
        }
        for svc in &self.services {
            out.extend_from_slice(&svc.tag.to_bytes());
            out.extend_from_slice(&svc.port.to_be_bytes());
        }
        out
    }

    /// Decode from the wire form.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        if payload.len() < ADDR_MSG_MIN_SIZE {
            return Err(ProtoError::BadFrame(format!(
                "announcement too short: {} bytes",
                payload.len()
            )));
        }
        let time = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mut host = [0u8; 16];
        host.copy_from_slice(&payload[4..20]);
        let port = u16::from_be_bytes([payload[20], payload[21]]);
        let mut owner = [0u8; 32];
        owner.copy_from_slice(&payload[22..54]);
        let n_chans = payload[54] as usize;
        let n_svcs = payload[55] as usize;

        let expect = ADDR_MSG_MIN_SIZE + n_chans * 4 + n_svcs * 6;
        if payload.len() != expect {
            return Err(ProtoError::BadFrame(format!(
                "announcement length {} does not match counts (expected {expect})",
                payload.len()
            )));
        }

        let mut at = ADDR_MSG_MIN_SIZE;
        let mut channels = Vec::with_capacity(n_chans);
        for _ in 0..n_chans {
            channels.push(Tag4CC::new([
                payload[at],
                payload[at + 1],
                payload[at + 2],
                payload[at + 3],
            ]));
            at += 4;
        }
        let mut services = Vec::with_capacity(n_svcs);
        for _ in 0..n_svcs {
            let tag = Tag4CC::new([
                payload[at],
                payload[at + 1],
                payload[at + 2],
                payload[at + 3],
            ]);
            let port = u16::from_be_bytes([payload[at + 4], payload[at + 5]]);
            services.push(Service { tag, port });
            at += 6;
        }

        Ok(Self {
            time,
            address: Address::from_host_port(host, port),
            owner,
            channels,
            services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CORE_NODE_DEFAULT_PORT, SERVICE_CORE};

    fn sample() -> AddressMsg {
        AddressMsg {
            time: unix_to_doge(1_722_470_400),
            address: Address::parse("203.0.113.5:42069", 0).unwrap(),
            owner: [7u8; 32],
            channels: vec![Tag4CC::new(*b"shib"), Tag4CC::new(*b"doge")],
            services: vec![Service {
                tag: SERVICE_CORE,
                port: CORE_NODE_DEFAULT_PORT,
            }],
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = sample();
        let back = AddressMsg::decode(&msg.encode()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_empty_lists_roundtrip() {
        let msg = AddressMsg {
            channels: vec![],
            services: vec![],
            ..sample()
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), ADDR_MSG_MIN_SIZE);
        assert_eq!(AddressMsg::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        assert!(AddressMsg::decode(&[0u8; ADDR_MSG_MIN_SIZE - 1]).is_err());
    }

    #[test]
    fn test_decode_rejects_count_mismatch() {
        let mut encoded = sample().encode();
        encoded.truncate(encoded.len() - 1);
        assert!(AddressMsg::decode(&encoded).is_err());
    }

    #[test]
    fn test_time_conversion() {
        let unix = 1_722_470_400;
        assert_eq!(doge_to_unix(unix_to_doge(unix)), unix);
        // times before the protocol epoch clamp to zero
        assert_eq!(unix_to_doge(0), 0);
    }

    #[test]
    fn test_encoding_is_time_prefixed() {
        // the announcement loop compares bodies modulo time by rewriting
        // the stored time into the fresh body before encoding
        let msg = sample();
        let mut other = msg.clone();
        other.time += 100;
        assert_ne!(msg.encode(), other.encode());
        other.time = msg.time;
        assert_eq!(msg.encode(), other.encode());
    }
}
