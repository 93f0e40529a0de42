//! Contacts: a node id paired with the UDP endpoint it is reachable at, and
//! their compact BEP5 wire encoding.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::id::{Id, ID_SIZE};
use crate::{Error, Result};

/// A node identity plus the address it is reachable at.
///
/// Equality is componentwise (spec.md §3: "Equality is componentwise").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeContact {
    pub id: Id,
    pub endpoint: SocketAddr,
}

impl NodeContact {
    pub fn new(id: Id, endpoint: SocketAddr) -> Self {
        Self { id, endpoint }
    }

    /// Encode as `id (20B) || ip (4 or 16B) || port (2B big-endian)`.
    pub fn encode_compact(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        encode_endpoint(&self.endpoint, out);
    }

    /// Decode one compact contact, IPv4 flavor (26 bytes), advancing `buf`.
    pub fn decode_compact_v4(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < 26 {
            return Err(Error::Protocol("truncated compact ipv4 node"));
        }
        let id = Id::from_bytestring(&buf[..ID_SIZE])?;
        let endpoint = decode_endpoint_v4(&buf[ID_SIZE..26])?;
        Ok((Self { id, endpoint }, &buf[26..]))
    }

    /// Decode one compact contact, IPv6 flavor (38 bytes), advancing `buf`.
    pub fn decode_compact_v6(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < 38 {
            return Err(Error::Protocol("truncated compact ipv6 node"));
        }
        let id = Id::from_bytestring(&buf[..ID_SIZE])?;
        let endpoint = decode_endpoint_v6(&buf[ID_SIZE..38])?;
        Ok((Self { id, endpoint }, &buf[38..]))
    }

    /// Decode a concatenated list of compact IPv4 contacts (BEP5 `nodes`).
    pub fn decode_compact_v4_list(mut buf: &[u8]) -> Result<Vec<Self>> {
        if buf.len() % 26 != 0 {
            return Err(Error::Protocol("nodes field has invalid length"));
        }
        let mut out = Vec::with_capacity(buf.len() / 26);
        while !buf.is_empty() {
            let (contact, rest) = Self::decode_compact_v4(buf)?;
            out.push(contact);
            buf = rest;
        }
        Ok(out)
    }

    /// Decode a concatenated list of compact IPv6 contacts (BEP5 `nodes6`).
    pub fn decode_compact_v6_list(mut buf: &[u8]) -> Result<Vec<Self>> {
        if buf.len() % 38 != 0 {
            return Err(Error::Protocol("nodes6 field has invalid length"));
        }
        let mut out = Vec::with_capacity(buf.len() / 38);
        while !buf.is_empty() {
            let (contact, rest) = Self::decode_compact_v6(buf)?;
            out.push(contact);
            buf = rest;
        }
        Ok(out)
    }

    /// Encode a list of contacts split by address family into `(nodes,
    /// nodes6)` compact blobs.
    pub fn encode_compact_list(contacts: &[Self]) -> (Vec<u8>, Vec<u8>) {
        let mut nodes = Vec::new();
        let mut nodes6 = Vec::new();
        for c in contacts {
            match c.endpoint {
                SocketAddr::V4(_) => c.encode_compact(&mut nodes),
                SocketAddr::V6(_) => c.encode_compact(&mut nodes6),
            }
        }
        (nodes, nodes6)
    }
}

/// Encode `ip (4 or 16B) || port (2B big-endian)`.
pub fn encode_endpoint(endpoint: &SocketAddr, out: &mut Vec<u8>) {
    match endpoint.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&endpoint.port().to_be_bytes());
}

/// Decode a 6-byte compact IPv4 peer endpoint (BEP5 `values` entries).
pub fn decode_endpoint_v4(buf: &[u8]) -> Result<SocketAddr> {
    if buf.len() != 6 {
        return Err(Error::Protocol("endpoint must be 6 bytes for ipv4"));
    }
    let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
    let port = u16::from_be_bytes([buf[4], buf[5]]);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Decode an 18-byte compact IPv6 endpoint.
pub fn decode_endpoint_v6(buf: &[u8]) -> Result<SocketAddr> {
    if buf.len() != 18 {
        return Err(Error::Protocol("endpoint must be 18 bytes for ipv6"));
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[..16]);
    let ip = Ipv6Addr::from(octets);
    let port = u16::from_be_bytes([buf[16], buf[17]]);
    Ok(SocketAddr::new(IpAddr::V6(ip), port))
}

/// Decode a concatenated list of compact 6-byte IPv4 peer endpoints (BEP5
/// `values`).
pub fn decode_peers_v4(buf: &[u8]) -> Result<Vec<SocketAddr>> {
    if buf.len() % 6 != 0 {
        return Err(Error::Protocol("peer value has invalid length"));
    }
    buf.chunks_exact(6).map(decode_endpoint_v4).collect()
}

/// A contact that may not have a known id yet (spec.md §4.5: "Bootstrap
/// endpoints (no known id) sort after all id-bearing candidates").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contact {
    pub endpoint: SocketAddr,
    pub id: Option<Id>,
}

impl From<NodeContact> for Contact {
    fn from(c: NodeContact) -> Self {
        Self {
            endpoint: c.endpoint,
            id: Some(c.id),
        }
    }
}

impl Contact {
    pub fn bootstrap(endpoint: SocketAddr) -> Self {
        Self { endpoint, id: None }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_v4_roundtrip() {
        let c = NodeContact::new(
            Id::random(),
            "203.0.113.5:6881".parse().unwrap(),
        );
        let mut buf = Vec::new();
        c.encode_compact(&mut buf);
        assert_eq!(buf.len(), 26);
        let (decoded, rest) = NodeContact::decode_compact_v4(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, c);
    }

    #[test]
    fn compact_v6_roundtrip() {
        let c = NodeContact::new(
            Id::random(),
            "[2001:db8::1]:6881".parse().unwrap(),
        );
        let mut buf = Vec::new();
        c.encode_compact(&mut buf);
        assert_eq!(buf.len(), 38);
        let (decoded, _) = NodeContact::decode_compact_v6(&buf).unwrap();
        assert_eq!(decoded, c);
    }

    #[test]
    fn peers_v4_list() {
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2000".parse().unwrap();
        let mut buf = Vec::new();
        encode_endpoint(&a, &mut buf);
        encode_endpoint(&b, &mut buf);
        let decoded = decode_peers_v4(&buf).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }
}
