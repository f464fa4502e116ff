//! Network addresses in the 16-byte-host form used on the wire and as
//! store keys.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use crate::ProtoError;

/// A host/port pair. The host is always held in IPv6 form; IPv4
/// addresses are v4-mapped (`::ffff:a.b.c.d`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    host: [u8; 16],
    port: u16,
}

/// Length of the fixed key/value record form: 16-byte host + 2-byte port.
pub const ADDRESS_RECORD_SIZE: usize = 18;

impl Address {
    /// Build from an IP and port, v4-mapping IPv4 hosts.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let v6 = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            host: v6.octets(),
            port,
        }
    }

    /// Build from the raw 16-byte host form.
    pub fn from_host_port(host: [u8; 16], port: u16) -> Self {
        Self { host, port }
    }

    /// The host as a std IP address, unmapping v4-mapped hosts.
    pub fn ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.host);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    /// The 16-byte host.
    pub fn host(&self) -> [u8; 16] {
        self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when both host and port are set.
    pub fn is_valid(&self) -> bool {
        self.port != 0 && self.host != [0u8; 16]
    }

    /// True for hosts that are not routable on the public internet.
    pub fn is_private(&self) -> bool {
        match self.ip() {
            IpAddr::V4(v4) => {
                v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_unspecified()
                    || v4.is_broadcast()
                    || v4.is_multicast()
            }
            IpAddr::V6(v6) => {
                v6.is_loopback() || v6.is_unspecified() || v6.is_multicast()
                    // fc00::/7 unique-local, fe80::/10 link-local
                    || (v6.segments()[0] & 0xfe00) == 0xfc00
                    || (v6.segments()[0] & 0xffc0) == 0xfe80
            }
        }
    }

    /// Serialize to the fixed 18-byte record.
    pub fn to_bytes(&self) -> [u8; ADDRESS_RECORD_SIZE] {
        let mut out = [0u8; ADDRESS_RECORD_SIZE];
        out[..16].copy_from_slice(&self.host);
        out[16..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Parse from the fixed 18-byte record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() != ADDRESS_RECORD_SIZE {
            return Err(ProtoError::BadAddress(format!(
                "address record must be {ADDRESS_RECORD_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut host = [0u8; 16];
        host.copy_from_slice(&bytes[..16]);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Ok(Self { host, port })
    }

    /// Parse `ip:port` / `[ip]:port`, or a bare IP with `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, ProtoError> {
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(Self::new(sock.ip(), sock.port()));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::new(ip, default_port));
        }
        Err(ProtoError::BadAddress(format!(
            "cannot parse {s:?} (use [<ip>]:<port> for IPv6)"
        )))
    }

    /// The std socket-address form, for dialing.
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(sock: SocketAddr) -> Self {
        Self::new(sock.ip(), sock.port())
    }
}

// Display writes the unmapped form so logs read naturally.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let addr = Address::parse("203.0.113.5:42069", 0).unwrap();
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), ADDRESS_RECORD_SIZE);
        let back = Address::from_bytes(&bytes).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_v4_mapped_host() {
        let addr = Address::parse("203.0.113.5:42069", 0).unwrap();
        let host = addr.host();
        assert_eq!(&host[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&host[12..], &[203, 0, 113, 5]);
        assert_eq!(addr.to_string(), "203.0.113.5:42069");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = Address::parse("[2001:db8::1]:42069", 0).unwrap();
        assert_eq!(addr.port(), 42069);
        assert_eq!(addr.to_string(), "[2001:db8::1]:42069");
    }

    #[test]
    fn test_bare_ip_uses_default_port() {
        let addr = Address::parse("203.0.113.5", 42069).unwrap();
        assert_eq!(addr.port(), 42069);
    }

    #[test]
    fn test_validity_and_privacy() {
        assert!(!Address::default().is_valid());
        assert!(Address::parse("203.0.113.5:42069", 0).unwrap().is_valid());
        assert!(Address::parse("192.168.1.1:42069", 0).unwrap().is_private());
        assert!(Address::parse("127.0.0.1:42069", 0).unwrap().is_private());
        assert!(!Address::parse("203.0.113.5:42069", 0).unwrap().is_private());
    }
}
