//! Dogecoin Core wire messages, as far as the crawler needs them:
//! the message envelope, `version`, `verack`, `getaddr` and `addr`.

use sha2::{Digest, Sha256};

use dogenet_proto::Address;

use crate::CrawlError;

/// Dogecoin mainnet message magic.
pub const MAINNET_MAGIC: u32 = 0xc0c0_c0c0;

/// Protocol version we speak.
pub const PROTOCOL_VERSION: i32 = 70015;

/// Envelope: magic (4) + command (12) + length (4) + checksum (4).
pub const ENVELOPE_SIZE: usize = 24;

/// Upper bound on payloads the crawler will read.
pub const MAX_PAYLOAD: usize = 2 * 1024 * 1024;

/// First four bytes of sha256(sha256(payload)).
fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// Frame a command + payload into a full envelope.
pub fn encode_envelope(command: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_SIZE + payload.len());
    out.extend_from_slice(&MAINNET_MAGIC.to_le_bytes());
    let mut cmd = [0u8; 12];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    out
}

/// Parse an envelope header; returns (command, payload length, checksum).
pub fn decode_envelope(header: &[u8; ENVELOPE_SIZE]) -> Result<(String, usize, [u8; 4]), CrawlError> {
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAINNET_MAGIC {
        return Err(CrawlError::BadMessage(format!("bad magic {magic:#x}")));
    }
    let end = header[4..16].iter().position(|&b| b == 0).unwrap_or(12);
    let command = std::str::from_utf8(&header[4..4 + end])
        .map_err(|_| CrawlError::BadMessage("non-ascii command".into()))?
        .to_string();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_PAYLOAD {
        return Err(CrawlError::BadMessage(format!("payload too large: {length}")));
    }
    let mut sum = [0u8; 4];
    sum.copy_from_slice(&header[20..24]);
    Ok((command, length, sum))
}

/// Verify a payload against its envelope checksum.
pub fn verify_checksum(payload: &[u8], expect: &[u8; 4]) -> Result<(), CrawlError> {
    if checksum(payload) != *expect {
        return Err(CrawlError::BadMessage("checksum mismatch".into()));
    }
    Ok(())
}

/// Little-endian reader over a payload.
struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CrawlError> {
        if self.at + n > self.buf.len() {
            return Err(CrawlError::BadMessage("truncated payload".into()));
        }
        let out = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn u16_be(&mut self) -> Result<u16, CrawlError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, CrawlError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> Result<u64, CrawlError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Bitcoin CompactSize.
    fn varint(&mut self) -> Result<u64, CrawlError> {
        let first = self.take(1)?[0];
        Ok(match first {
            0xfd => self.u16_le()? as u64,
            0xfe => self.u32_le()? as u64,
            0xff => self.u64_le()?,
            n => n as u64,
        })
    }

    fn u16_le(&mut self) -> Result<u16, CrawlError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn var_string(&mut self) -> Result<String, CrawlError> {
        let len = self.varint()? as usize;
        if len > 256 {
            return Err(CrawlError::BadMessage("agent string too long".into()));
        }
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }
}

fn put_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// A network address as embedded in `version` (no timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetAddr {
    pub services: u64,
    pub address: Address,
}

fn encode_net_addr(out: &mut Vec<u8>, addr: &NetAddr) {
    out.extend_from_slice(&addr.services.to_le_bytes());
    out.extend_from_slice(&addr.address.host());
    out.extend_from_slice(&addr.address.port().to_be_bytes());
}

fn decode_net_addr(r: &mut Reader<'_>) -> Result<NetAddr, CrawlError> {
    let services = r.u64_le()?;
    let mut host = [0u8; 16];
    host.copy_from_slice(r.take(16)?);
    let port = r.u16_be()?;
    Ok(NetAddr {
        services,
        address: Address::from_host_port(host, port),
    })
}

/// The `version` handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub remote_addr: NetAddr,
    pub local_addr: NetAddr,
    pub nonce: u64,
    pub agent: String,
    pub height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(86 + self.agent.len());
        out.extend_from_slice(&(self.version as u32).to_le_bytes());
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&(self.timestamp as u64).to_le_bytes());
        encode_net_addr(&mut out, &self.remote_addr);
        encode_net_addr(&mut out, &self.local_addr);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        put_varint(&mut out, self.agent.len() as u64);
        out.extend_from_slice(self.agent.as_bytes());
        out.extend_from_slice(&(self.height as u32).to_le_bytes());
        out.push(self.relay as u8);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CrawlError> {
        let mut r = Reader::new(payload);
        let version = r.u32_le()? as i32;
        let services = r.u64_le()?;
        let timestamp = r.u64_le()? as i64;
        let remote_addr = decode_net_addr(&mut r)?;
        let mut msg = Self {
            version,
            services,
            timestamp,
            remote_addr,
            local_addr: NetAddr::default(),
            nonce: 0,
            agent: String::new(),
            height: 0,
            relay: false,
        };
        if version >= 106 {
            msg.local_addr = decode_net_addr(&mut r)?;
            msg.nonce = r.u64_le()?;
            msg.agent = r.var_string()?;
            msg.height = r.u32_le()? as i32;
            if version >= 70001 && r.remaining() > 0 {
                msg.relay = r.take(1)?[0] != 0;
            }
        }
        Ok(msg)
    }
}

/// One `addr` entry: last-seen time, services and address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub time: u32,
    pub services: u64,
    pub address: Address,
}

/// Decode an `addr` payload.
pub fn decode_addr_list(payload: &[u8]) -> Result<Vec<AddrEntry>, CrawlError> {
    let mut r = Reader::new(payload);
    let count = r.varint()?;
    if count > 1000 {
        return Err(CrawlError::BadMessage(format!("addr count too large: {count}")));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let time = r.u32_le()?;
        let net = decode_net_addr(&mut r)?;
        entries.push(AddrEntry {
            time,
            services: net.services,
            address: net.address,
        });
    }
    Ok(entries)
}
