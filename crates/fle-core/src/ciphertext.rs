//! Wire-exact codec for the ciphertext blob carried in a binary subtype 6
//! element once a field has been encrypted.
//!
//! ```text
//! offset 0  : u8  blob_subtype (1=deterministic, 2=random)
//! offset 1  : u8[16] key_uuid
//! offset 17 : u8  original_bson_type
//! offset 18 : u8[] ciphertext (length = total_len - 18)
//! ```

use std::borrow::Cow;

use crate::error::Error;

/// Minimum valid length of a serialized ciphertext blob.
pub const MIN_LEN: usize = 19;

/// Which algorithm produced a ciphertext blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSubtype {
    /// Deterministic encryption: same plaintext + key + iv always produce the
    /// same ciphertext.
    Deterministic,
    /// Randomized encryption: a fresh iv is used for every value.
    Random,
}

impl BlobSubtype {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Random),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }
}

/// A parsed (or freshly constructed) ciphertext blob.
///
/// Parsing borrows directly out of the input byte slice; construction for
/// serialization can hold owned buffers instead, so the same type serves
/// both directions of the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext<'a> {
    /// Deterministic or random.
    pub blob_subtype: BlobSubtype,
    /// The 16-byte key UUID this value was encrypted under.
    pub key_uuid: Cow<'a, [u8]>,
    /// The BSON type the plaintext deserializes to once decrypted.
    pub original_bson_type: u8,
    /// The encrypted payload, opaque to this codec.
    pub ciphertext: Cow<'a, [u8]>,
}

impl<'a> Ciphertext<'a> {
    /// Parse a ciphertext blob out of a byte slice, borrowing where possible.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < MIN_LEN {
            return Err(Error::MalformedCiphertext("too small".to_string()));
        }
        let blob_subtype = BlobSubtype::from_byte(bytes[0])
            .ok_or_else(|| Error::MalformedCiphertext("expected blob subtype of 1 or 2".to_string()))?;
        Ok(Self {
            blob_subtype,
            key_uuid: Cow::Borrowed(&bytes[1..17]),
            original_bson_type: bytes[17],
            ciphertext: Cow::Borrowed(&bytes[18..]),
        })
    }

    /// Construct an owned ciphertext blob, e.g. the output of encrypting a
    /// marking's value.
    pub fn new_owned(
        blob_subtype: BlobSubtype,
        key_uuid: [u8; 16],
        original_bson_type: u8,
        ciphertext: Vec<u8>,
    ) -> Ciphertext<'static> {
        Ciphertext {
            blob_subtype,
            key_uuid: Cow::Owned(key_uuid.to_vec()),
            original_bson_type,
            ciphertext: Cow::Owned(ciphertext),
        }
    }

    /// The key UUID as a [`uuid::Uuid`], if the stored bytes are exactly 16
    /// long (always true for anything produced by [`Ciphertext::parse`] or
    /// [`Ciphertext::new_owned`]).
    pub fn key_uuid(&self) -> Option<uuid::Uuid> {
        <[u8; 16]>::try_from(self.key_uuid.as_ref()).ok().map(uuid::Uuid::from_bytes)
    }

    /// Serialize back to the wire-exact byte layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_LEN - 1 + self.ciphertext.len());
        out.push(self.blob_subtype.to_byte());
        out.extend_from_slice(&self.key_uuid);
        out.push(self.original_bson_type);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimum_blob() {
        let mut bytes = vec![0x01];
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.push(0x02);
        bytes.push(0x41);
        let c = Ciphertext::parse(&bytes).unwrap();
        assert_eq!(c.blob_subtype, BlobSubtype::Deterministic);
        assert_eq!(c.key_uuid.as_ref(), &[0u8; 16]);
        assert_eq!(c.original_bson_type, 2);
        assert_eq!(c.ciphertext.as_ref(), &[0x41]);
    }

    #[test]
    fn reject_short_blob() {
        let bytes = vec![0x01; 18];
        let err = Ciphertext::parse(&bytes).unwrap_err();
        assert_eq!(err, Error::MalformedCiphertext("too small".to_string()));
    }

    #[test]
    fn reject_bad_subtype() {
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.push(0x02);
        bytes.push(0x41);
        let err = Ciphertext::parse(&bytes).unwrap_err();
        assert_eq!(
            err,
            Error::MalformedCiphertext("expected blob subtype of 1 or 2".to_string())
        );
    }

    #[test]
    fn serialize_round_trips() {
        let mut bytes = vec![0x02];
        bytes.extend_from_slice(&[7u8; 16]);
        bytes.push(5);
        bytes.extend_from_slice(&[9, 9, 9]);
        let parsed = Ciphertext::parse(&bytes).unwrap();
        assert_eq!(parsed.serialize(), bytes);
    }

    proptest::proptest! {
        #[test]
        fn parse_serialize_round_trip(
            subtype in proptest::sample::select(vec![1u8, 2u8]),
            key_uuid in proptest::collection::vec(proptest::num::u8::ANY, 16),
            original_bson_type in proptest::num::u8::ANY,
            payload in proptest::collection::vec(proptest::num::u8::ANY, 1..64),
        ) {
            let mut bytes = vec![subtype];
            bytes.extend_from_slice(&key_uuid);
            bytes.push(original_bson_type);
            bytes.extend_from_slice(&payload);

            let first = Ciphertext::parse(&bytes).unwrap();
            let reserialized = first.serialize();
            let second = Ciphertext::parse(&reserialized).unwrap();
            prop_assert_eq!(first, second);
            prop_assert_eq!(reserialized, bytes);
        }
    }
}
