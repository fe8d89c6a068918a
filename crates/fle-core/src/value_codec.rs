//! Converts a single BSON value to and from the raw bytes a ciphertext blob
//! carries, by round-tripping it through a one-field wrapper document
//! `{v: <value>}` and slicing out everything but the element's own value
//! bytes. This is what lets a ciphertext blob record a plain
//! `original_bson_type` tag and a flat byte buffer instead of a full BSON
//! document.

use bson::{Bson, Document};

use crate::error::Error;

/// Encode `value` to `(bson_type, value_bytes)`, the pair a ciphertext blob
/// stores as `original_bson_type` and `ciphertext` (pre-encryption).
pub fn encode_value(value: &Bson) -> (u8, Vec<u8>) {
    let wrapper = bson::doc! { "v": value.clone() };
    let mut full = Vec::new();
    wrapper.to_writer(&mut full).expect("bson document always serializes");
    // layout: i32 len | u8 element_type | "v\0" | <value bytes> | u8 doc terminator
    let bson_type = full[4];
    let value_bytes = full[4 + 1 + 2..full.len() - 1].to_vec();
    (bson_type, value_bytes)
}

/// Reverse of [`encode_value`]: rebuild a one-field wrapper document around
/// `value_bytes` tagged with `bson_type` and pull the value back out.
pub fn decode_value(bson_type: u8, value_bytes: &[u8]) -> Result<Bson, Error> {
    let mut full = vec![0u8; 4];
    full.push(bson_type);
    full.extend_from_slice(b"v\0");
    full.extend_from_slice(value_bytes);
    full.push(0x00);
    let len = i32::try_from(full.len()).map_err(|_| Error::MalformedBson("value too large".to_string()))?;
    full[0..4].copy_from_slice(&len.to_le_bytes());
    let doc = Document::from_reader(full.as_slice()).map_err(|e| Error::MalformedBson(e.to_string()))?;
    doc.get("v").cloned().ok_or_else(|| Error::MalformedBson("decoded wrapper missing v".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar() {
        let value = Bson::Int32(42);
        let (bson_type, bytes) = encode_value(&value);
        let decoded = decode_value(bson_type, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn round_trips_string() {
        let value = Bson::String("hello field".to_string());
        let (bson_type, bytes) = encode_value(&value);
        let decoded = decode_value(bson_type, &bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn round_trips_document() {
        let value = Bson::Document(bson::doc! { "nested": true, "n": 7 });
        let (bson_type, bytes) = encode_value(&value);
        let decoded = decode_value(bson_type, &bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
