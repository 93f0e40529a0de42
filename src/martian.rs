//! Filters out endpoints that cannot possibly be useful remote peers,
//! ported verbatim from `original_source/src/bittorrent/is_martian.h`.

use std::net::SocketAddr;

/// True if `endpoint` is port 0, loopback, multicast, link-local,
/// v4-mapped-v6, or unspecified.
pub fn is_martian(endpoint: &SocketAddr) -> bool {
    if endpoint.port() == 0 {
        return true;
    }

    match endpoint.ip() {
        std::net::IpAddr::V4(v4) => v4.is_multicast() || v4.is_loopback() || v4.octets()[0] == 0,
        std::net::IpAddr::V6(v6) => {
            v6.is_multicast()
                || is_unicast_link_local(&v6)
                || v6.to_ipv4_mapped().is_some()
                || v6.is_loopback()
                || v6.is_unspecified()
        }
    }
}

fn is_unicast_link_local(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_port_zero() {
        assert!(is_martian(&"1.2.3.4:0".parse().unwrap()));
    }

    #[test]
    fn rejects_loopback_and_multicast() {
        assert!(is_martian(&"127.0.0.1:80".parse().unwrap()));
        assert!(is_martian(&"239.1.2.3:80".parse().unwrap()));
    }

    #[test]
    fn accepts_ordinary_address() {
        assert!(!is_martian(&"203.0.113.5:6881".parse().unwrap()));
    }

    #[test]
    fn rejects_v4_mapped_v6() {
        assert!(is_martian(&"[::ffff:127.0.0.1]:80".parse().unwrap()));
    }
}
