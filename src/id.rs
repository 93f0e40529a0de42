//! 160-bit node and key identifiers and the XOR distance metric.

use std::fmt;
use std::net::Ipv4Addr;

use crc::{Crc, CRC_32_ISCSI};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of bytes in a [Id].
pub const ID_SIZE: usize = 20;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A 160-bit identifier.
///
/// Used both as a node id (BEP5) and as the address of immutable/mutable
/// data and infohashes (BEP44/BEP5). Two orderings matter: plain byte order
/// (used for display/parsing) and, given a pivot, the "closer-to" order
/// defined by treating `self ^ other` as an unsigned 160-bit integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub(crate) [u8; ID_SIZE]);

impl Id {
    /// Build an [Id] from a 20 byte array.
    pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// A cryptographically random id, suitable as a node id with no BEP42
    /// IP constraint (used when no observed WAN address is available yet).
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_SIZE];
        getrandom::getrandom(&mut bytes).expect("getrandom should not fail");
        Self(bytes)
    }

    /// Parse an [Id] out of a 20-byte slice.
    pub fn from_bytestring(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }
        let mut out = [0u8; ID_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// XOR distance between two ids, as a 160-bit big-endian value.
    pub fn distance(&self, other: &Id) -> Id {
        let mut out = [0u8; ID_SIZE];
        for i in 0..ID_SIZE {
            out[i] = self.0[i] ^ other.0[i];
        }
        Id(out)
    }

    /// Index (0 = most significant bit of byte 0) of the highest set bit in
    /// `self ^ other`, i.e. which routing-table bucket `other` belongs to
    /// relative to `self`. Returns `None` if `self == other`.
    pub fn bucket_index(&self, other: &Id) -> Option<usize> {
        let distance = self.distance(other);
        for (byte_i, byte) in distance.0.iter().enumerate() {
            if *byte != 0 {
                let bit_i = byte.leading_zeros() as usize;
                return Some(byte_i * 8 + bit_i);
            }
        }
        None
    }

    /// Total order of `a` and `b` by closeness to `self`: true iff `a` is
    /// strictly closer to `self` than `b` is.
    pub fn closer(&self, a: &Id, b: &Id) -> bool {
        self.distance(a) < self.distance(b)
    }

    /// Derive a node id that satisfies the BEP42 IP-dependent constraint for
    /// `ip`, using `rand_byte` as the caller-chosen entropy for the low 3
    /// bits of the first byte (BEP42 §"Security" requires these bits be
    /// attacker-unpredictable but fixed once chosen for a given external
    /// port+ip).
    pub fn from_ip(ip: Ipv4Addr, rand_byte: u8) -> Self {
        const MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];

        let mut octets = ip.octets();
        for i in 0..4 {
            octets[i] &= MASK[i];
        }
        octets[0] |= (rand_byte & 0x7) << 5;

        let mut digest = CRC32C.digest();
        digest.update(&octets);
        let crc = digest.finalize();

        let mut bytes = [0u8; ID_SIZE];
        bytes[0] = (crc >> 24) as u8;
        bytes[1] = (crc >> 16) as u8;
        bytes[2] = ((crc >> 8) as u8 & 0xf8) | (rand_byte & 0x7);

        getrandom::getrandom(&mut bytes[3..19]).expect("getrandom should not fail");
        bytes[19] = rand_byte;

        Self(bytes)
    }

    /// Whether `self` satisfies the BEP42 constraint for the given IPv4
    /// address, i.e. could plausibly have been generated by [Id::from_ip]
    /// for this `ip`. Used by [crate::dht_node::DhtNode] to decide whether a
    /// claimed id should be trusted in the routing table.
    pub fn is_valid_for_ip(&self, ip: Ipv4Addr) -> bool {
        const MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];

        let rand_byte = self.0[19];
        let mut octets = ip.octets();
        for i in 0..4 {
            octets[i] &= MASK[i];
        }
        octets[0] |= (rand_byte & 0x7) << 5;

        let mut digest = CRC32C.digest();
        digest.update(&octets);
        let crc = digest.finalize();

        let expected_0 = (crc >> 24) as u8;
        let expected_1 = (crc >> 16) as u8;
        let expected_2_top5 = ((crc >> 8) as u8) & 0xf8;

        self.0[0] == expected_0
            && self.0[1] == expected_1
            && (self.0[2] & 0xf8) == expected_2_top5
            && (self.0[2] & 0x7) == (rand_byte & 0x7)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdSize(s.len() / 2));
        }
        let mut bytes = [0u8; ID_SIZE];
        for i in 0..ID_SIZE {
            bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding)?;
        }
        Ok(Id(bytes))
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Id::from_bytestring(&bytes).map_err(serde::de::Error::custom)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Self(bytes)
    }
}

/// `sha1(bytes)` as an [Id], used to derive infohashes from swarm names
/// (spec: "Swarm names map to infohashes by sha1(swarm_name)") and to
/// address immutable BEP44 items.
pub fn sha1(bytes: impl AsRef<[u8]>) -> Id {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(bytes.as_ref());
    Id(hasher.digest().bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn xor_self_is_zero() {
        let a = Id::random();
        assert_eq!(a.distance(&a), Id([0; ID_SIZE]));
    }

    #[test]
    fn closer_to_is_total_order() {
        let pivot = Id::random();
        let a = Id::random();
        let b = Id::random();
        let c = Id::random();

        // Irreflexivity.
        assert!(!pivot.closer(&a, &a));

        // Exactly one of a<b, b<a, a==b holds (antisymmetry + totality).
        let ab = pivot.closer(&a, &b);
        let ba = pivot.closer(&b, &a);
        assert!(!(ab && ba));
        assert!(ab || ba || a == b);

        // Transitivity, sampled: if a<b and b<c then a<c.
        if pivot.closer(&a, &b) && pivot.closer(&b, &c) {
            assert!(pivot.closer(&a, &c));
        }
    }

    #[test]
    fn bucket_index_matches_highest_set_bit() {
        let mut a = [0u8; ID_SIZE];
        let mut b = [0u8; ID_SIZE];
        a[0] = 0b1000_0000;
        let id_a = Id(a);
        let id_b = Id(b);
        assert_eq!(id_a.bucket_index(&id_b), Some(0));

        b[19] = 0b0000_0001;
        let id_b2 = Id(b);
        assert_eq!(Id([0; ID_SIZE]).bucket_index(&id_b2), Some(159));
    }

    #[test]
    fn bep42_roundtrip() {
        let ip = Ipv4Addr::new(124, 31, 75, 21);
        let id = Id::from_ip(ip, 42 & 0x7);
        assert!(id.is_valid_for_ip(ip));
        assert!(!id.is_valid_for_ip(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn sha1_hello() {
        let id = sha1(b"hello");
        assert_eq!(id.to_string().len(), 40);
    }

    #[test]
    fn from_str_roundtrip() {
        let id = Id::random();
        let s = id.to_string();
        let parsed: Id = s.parse().unwrap();
        assert_eq!(id, parsed);
    }
}
