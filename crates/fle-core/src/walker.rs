//! Depth-first traversal over a BSON document that locates binary subtype 6
//! elements (markings or ciphertext blobs) in arbitrary document shape.
//!
//! [`Walker::collect`] visits matching elements without modifying the
//! document; [`Walker::transform`] rebuilds the document, replacing each
//! matching element with whatever the mapper returns. Traversal order is
//! depth-first, document order — this is observable, since it determines the
//! order key ids are added to the broker.

use bson::spec::BinarySubtype;
use bson::{Bson, Document};

use crate::error::Error;

/// Which kind of binary subtype 6 payload a traversal is looking for,
/// distinguished by the payload's leading discriminator byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Discriminator byte 0: an unencrypted marking.
    Marking,
    /// Discriminator byte 1 or 2: an already-encrypted ciphertext blob.
    Ciphertext,
}

impl Filter {
    fn matches(self, discriminator: u8) -> bool {
        match self {
            Self::Marking => discriminator == 0,
            Self::Ciphertext => discriminator == 1 || discriminator == 2,
        }
    }

    /// The slice a visitor/mapper receives for a matching element: the
    /// marking codec never needs the (always-zero) discriminator byte, but
    /// the ciphertext codec treats byte 0 as its meaningful `blob_subtype`
    /// and expects it included.
    fn payload<'a>(self, bytes: &'a [u8]) -> &'a [u8] {
        match self {
            Self::Marking => &bytes[1..],
            Self::Ciphertext => bytes,
        }
    }
}

fn is_encrypted_binary(value: &Bson) -> Option<&[u8]> {
    match value {
        Bson::Binary(bin) if bin.subtype == BinarySubtype::Encrypted => Some(bin.bytes.as_slice()),
        _ => None,
    }
}

/// Stateless traversal entry point; both modes are plain recursive functions
/// over a [`bson::Document`].
pub struct Walker;

impl Walker {
    /// Depth-first descent that calls `visitor` with the payload slice of
    /// every element matching `filter`. Does not modify `doc`.
    pub fn collect(doc: &Document, filter: Filter, visitor: &mut dyn FnMut(&[u8])) {
        for (_, value) in doc {
            Self::collect_value(value, filter, visitor);
        }
    }

    fn collect_value(value: &Bson, filter: Filter, visitor: &mut dyn FnMut(&[u8])) {
        match value {
            Bson::Document(inner) => Self::collect(inner, filter, visitor),
            Bson::Array(items) => {
                for item in items {
                    Self::collect_value(item, filter, visitor);
                }
            }
            other => {
                if let Some(bytes) = is_encrypted_binary(other) {
                    if let Some(&discriminator) = bytes.first() {
                        if filter.matches(discriminator) {
                            visitor(filter.payload(bytes));
                        }
                    }
                }
            }
        }
    }

    /// Depth-first descent that rebuilds `doc`, replacing every element
    /// matching `filter` with `mapper`'s output and copying everything else
    /// verbatim.
    pub fn transform(
        doc: &Document,
        filter: Filter,
        mapper: &mut dyn FnMut(&[u8]) -> Result<Bson, Error>,
    ) -> Result<Document, Error> {
        let mut out = Document::new();
        for (key, value) in doc {
            out.insert(key.clone(), Self::transform_value(value, filter, mapper)?);
        }
        Ok(out)
    }

    fn transform_value(
        value: &Bson,
        filter: Filter,
        mapper: &mut dyn FnMut(&[u8]) -> Result<Bson, Error>,
    ) -> Result<Bson, Error> {
        match value {
            Bson::Document(inner) => Ok(Bson::Document(Self::transform(inner, filter, mapper)?)),
            Bson::Array(items) => {
                let mut mapped = Vec::with_capacity(items.len());
                for item in items {
                    mapped.push(Self::transform_value(item, filter, mapper)?);
                }
                Ok(Bson::Array(mapped))
            }
            other => {
                if let Some(bytes) = is_encrypted_binary(other) {
                    if let Some(&discriminator) = bytes.first() {
                        if filter.matches(discriminator) {
                            return mapper(filter.payload(bytes));
                        }
                    }
                }
                Ok(other.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::spec::BinarySubtype;
    use bson::{doc, Binary};

    fn marking_binary(discriminator: u8) -> Bson {
        let mut bytes = vec![discriminator];
        bytes.extend_from_slice(b"payload");
        Bson::Binary(Binary { subtype: BinarySubtype::Encrypted, bytes })
    }

    #[test]
    fn collect_finds_nested_markings() {
        let doc = doc! {
            "a": marking_binary(0),
            "b": { "c": marking_binary(0) },
            "d": [marking_binary(0), 1, marking_binary(1)],
        };
        let mut seen = Vec::new();
        Walker::collect(&doc, Filter::Marking, &mut |payload| seen.push(payload.to_vec()));
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|p| p == b"payload"));
    }

    #[test]
    fn collect_skips_non_matching_subtype() {
        let doc = doc! { "a": marking_binary(1) };
        let mut seen = 0;
        Walker::collect(&doc, Filter::Marking, &mut |_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn transform_replaces_matching_only() {
        let doc = doc! {
            "a": marking_binary(0),
            "b": 7,
        };
        let out = Walker::transform(&doc, Filter::Marking, &mut |_| Ok(Bson::Int32(99))).unwrap();
        assert_eq!(out.get_i32("a").unwrap(), 99);
        assert_eq!(out.get_i32("b").unwrap(), 7);
    }

    #[test]
    fn transform_is_identity_with_no_matches() {
        let doc = doc! { "a": 1, "b": { "c": "x" }, "d": [1, 2, 3] };
        let out = Walker::transform(&doc, Filter::Marking, &mut |_| Ok(Bson::Null)).unwrap();
        assert_eq!(out, doc);
    }
}
