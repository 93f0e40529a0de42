//! BEP44 immutable and mutable data items.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::id::{sha1, Id};
use crate::{Error, Result};

/// Encoded-value size limit enforced on `put` (error 205).
pub const MAX_ENCODED_VALUE_SIZE: usize = 1000;
/// Salt size limit enforced on `put` (error 207).
pub const MAX_SALT_SIZE: usize = 64;

/// An immutable BEP44 item, addressed by `sha1(bencode(value))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableItem {
    pub value: Vec<u8>,
}

impl ImmutableItem {
    pub fn new(value: Vec<u8>) -> Self {
        Self { value }
    }

    /// `sha1(bencode(value))`. `value` is already the bencoded payload, as
    /// produced by `serde_bencode::to_bytes`.
    pub fn target(&self) -> Id {
        sha1(&self.value)
    }
}

/// A BEP44 mutable item: a signed, versioned, optionally salted value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableItem {
    pub public_key: [u8; 32],
    pub salt: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub seq: i64,
    pub signature: [u8; 64],
}

impl MutableItem {
    /// Sign a fresh mutable item. `value` must already be the bencoded
    /// payload bytes.
    pub fn sign(signing_key: &SigningKey, salt: Option<Vec<u8>>, value: Vec<u8>, seq: i64) -> Self {
        let signable = Self::signable(salt.as_deref(), &value, seq);
        let signature = signing_key.sign(&signable);

        Self {
            public_key: signing_key.verifying_key().to_bytes(),
            salt,
            value,
            seq,
            signature: signature.to_bytes(),
        }
    }

    /// `sha1(public_key || salt)` (BEP44 target for mutable items).
    pub fn target(&self) -> Id {
        Self::target_from_key(&self.public_key, self.salt.as_deref())
    }

    pub fn target_from_key(public_key: &[u8; 32], salt: Option<&[u8]>) -> Id {
        let mut buf = Vec::with_capacity(32 + salt.map(|s| s.len()).unwrap_or(0));
        buf.extend_from_slice(public_key);
        if let Some(salt) = salt {
            buf.extend_from_slice(salt);
        }
        sha1(&buf)
    }

    /// `"3:seqi<seq>e1:v" ‖ bencode(value)`, with a `4:salt<len>:<salt>`
    /// prefix inserted before `3:seq...` when a salt is present.
    fn signable(salt: Option<&[u8]>, value: &[u8], seq: i64) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(salt) = salt {
            out.extend_from_slice(format!("4:salt{}:", salt.len()).as_bytes());
            out.extend_from_slice(salt);
        }
        out.extend_from_slice(format!("3:seqi{}e1:v", seq).as_bytes());
        out.extend_from_slice(value);
        out
    }

    pub fn verify(&self) -> Result<()> {
        if self.value.len() >= MAX_ENCODED_VALUE_SIZE {
            return Err(Error::ValueTooBig);
        }
        if self.salt.as_ref().map(|s| s.len()).unwrap_or(0) > MAX_SALT_SIZE {
            return Err(Error::SaltTooBig);
        }

        let verifying_key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| Error::InvalidSignature)?;
        let signature = Signature::from_bytes(&self.signature);
        let signable = Self::signable(self.salt.as_deref(), &self.value, self.seq);

        verifying_key
            .verify(&signable, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn immutable_target_is_sha1_of_bencode() {
        let item = ImmutableItem::new(b"5:hello".to_vec());
        assert_eq!(item.target(), sha1(b"5:hello"));
    }

    #[test]
    fn mutable_signature_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let item = MutableItem::sign(&signing_key, None, b"1:a".to_vec(), 1);
        assert!(item.verify().is_ok());
    }

    #[test]
    fn mutable_signature_with_salt_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let item = MutableItem::sign(
            &signing_key,
            Some(b"some-salt".to_vec()),
            b"1:a".to_vec(),
            7,
        );
        assert!(item.verify().is_ok());
        assert_eq!(
            item.target(),
            MutableItem::target_from_key(&signing_key.verifying_key().to_bytes(), Some(b"some-salt"))
        );
    }

    #[test]
    fn tampered_value_fails_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut item = MutableItem::sign(&signing_key, None, b"1:a".to_vec(), 1);
        item.value = b"1:b".to_vec();
        assert!(item.verify().is_err());
    }

    #[test]
    fn value_too_big_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let huge = vec![b'a'; MAX_ENCODED_VALUE_SIZE];
        let item = MutableItem::sign(&signing_key, None, huge, 1);
        assert!(matches!(item.verify(), Err(Error::ValueTooBig)));
    }
}
