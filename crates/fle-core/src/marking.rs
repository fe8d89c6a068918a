//! Codec for an encryption marking: the placeholder an external
//! query-analysis step leaves in place of a field value that still needs to
//! be encrypted.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use uuid::Uuid;

use crate::error::Error;

/// The algorithm a marking (or an already-encrypted blob) requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Same plaintext + key + iv always produce the same ciphertext.
    Deterministic,
    /// A fresh iv is drawn for every value.
    Random,
}

impl Algorithm {
    fn from_i32(v: i32) -> Result<Self, Error> {
        match v {
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Random),
            other => Err(Error::MalformedMarking(format!("unknown algorithm {other}"))),
        }
    }

    fn to_i32(self) -> i32 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }
}

impl From<Algorithm> for crate::ciphertext::BlobSubtype {
    fn from(a: Algorithm) -> Self {
        match a {
            Algorithm::Deterministic => Self::Deterministic,
            Algorithm::Random => Self::Random,
        }
    }
}

/// How a marking (or a ciphertext blob) names the key it uses.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRef {
    /// Direct key id.
    Id(Uuid),
    /// Indirect reference by the key document's `keyAltNames` entry.
    AltName(Bson),
}

/// A parsed (or synthetically constructed) encryption marking.
#[derive(Debug, Clone, PartialEq)]
pub struct Marking {
    /// Which key this value should be encrypted under.
    pub key_ref: KeyRef,
    /// Deterministic or random.
    pub algorithm: Algorithm,
    /// Caller-supplied iv; required for deterministic encryption, absent for
    /// most random encryption (the crypto façade draws its own).
    pub iv: Option<[u8; 16]>,
    value: Bson,
}

impl Marking {
    /// Parse a marking out of the BSON document carried as the payload of a
    /// binary subtype 6, discriminator-0 element.
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let doc = Document::from_reader(payload)
            .map_err(|e| Error::MalformedMarking(format!("invalid bson: {e}")))?;
        Self::from_document(doc)
    }

    fn from_document(doc: Document) -> Result<Self, Error> {
        let has_id = doc.contains_key("ki");
        let has_alt_name = doc.contains_key("ka");
        if has_id == has_alt_name {
            return Err(Error::MalformedMarking(
                "exactly one of ki or ka must be set".to_string(),
            ));
        }

        let key_ref = if has_id {
            let bin = match doc.get("ki") {
                Some(Bson::Binary(bin)) => bin,
                _ => return Err(Error::MalformedMarking("ki must be a binary uuid".to_string())),
            };
            let bytes: [u8; 16] = bin
                .bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::MalformedMarking("ki must be 16 bytes".to_string()))?;
            KeyRef::Id(Uuid::from_bytes(bytes))
        } else {
            KeyRef::AltName(
                doc.get("ka")
                    .cloned()
                    .ok_or_else(|| Error::MalformedMarking("ka must be set".to_string()))?,
            )
        };

        let a = doc
            .get_i32("a")
            .map_err(|_| Error::MalformedMarking("a must be an int32".to_string()))?;
        let algorithm = Algorithm::from_i32(a)?;

        let iv = match doc.get("iv") {
            None => None,
            Some(Bson::Binary(bin)) => {
                let bytes: [u8; 16] = bin
                    .bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::MalformedMarking("iv must be 16 bytes".to_string()))?;
                Some(bytes)
            }
            Some(_) => return Err(Error::MalformedMarking("iv must be binary".to_string())),
        };

        let value = doc
            .get("v")
            .cloned()
            .ok_or_else(|| Error::MalformedMarking("v must be set".to_string()))?;

        Ok(Self { key_ref, algorithm, iv, value })
    }

    /// Construct a marking directly, e.g. the synthetic marking an explicit
    /// encrypt context builds from its options and `{v: ...}` message.
    pub fn new(key_ref: KeyRef, algorithm: Algorithm, iv: Option<[u8; 16]>, value: Bson) -> Self {
        Self { key_ref, algorithm, iv, value }
    }

    /// The plaintext value this marking asks to be encrypted.
    pub fn value(&self) -> &Bson {
        &self.value
    }

    /// Serialize this marking back to a BSON document of the wire shape.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        match &self.key_ref {
            KeyRef::Id(uuid) => {
                doc.insert(
                    "ki",
                    Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: uuid.as_bytes().to_vec() }),
                );
            }
            KeyRef::AltName(name) => {
                doc.insert("ka", name.clone());
            }
        }
        doc.insert("a", self.algorithm.to_i32());
        if let Some(iv) = self.iv {
            doc.insert(
                "iv",
                Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: iv.to_vec() }),
            );
        }
        doc.insert("v", self.value.clone());
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn marking_doc(key_uuid: [u8; 16]) -> Document {
        doc! {
            "ki": Bson::Binary(Binary { subtype: BinarySubtype::Uuid, bytes: key_uuid.to_vec() }),
            "a": 1,
            "v": 42,
        }
    }

    #[test]
    fn parses_id_marking() {
        let doc = marking_doc([1u8; 16]);
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        let marking = Marking::parse(&bytes).unwrap();
        assert_eq!(marking.key_ref, KeyRef::Id(Uuid::from_bytes([1u8; 16])));
        assert_eq!(marking.algorithm, Algorithm::Deterministic);
        assert_eq!(marking.value(), &Bson::Int32(42));
    }

    #[test]
    fn rejects_both_ki_and_ka() {
        let mut doc = marking_doc([1u8; 16]);
        doc.insert("ka", "alt");
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        assert!(Marking::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_neither_ki_nor_ka() {
        let doc = doc! { "a": 1, "v": 42 };
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        assert!(Marking::parse(&bytes).is_err());
    }

    #[test]
    fn round_trips_through_to_document() {
        let marking = Marking::new(KeyRef::Id(Uuid::from_bytes([3u8; 16])), Algorithm::Random, None, Bson::String("x".to_string()));
        let doc = marking.to_document();
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        let reparsed = Marking::parse(&bytes).unwrap();
        assert_eq!(reparsed, marking);
    }
}
