//! Shared primitives for the field-level encryption driver core: context ids,
//! the error type, the ciphertext blob codec, the marking codec, and the BSON
//! transform walker.

#![deny(unsafe_code)]

pub mod ciphertext;
pub mod error;
pub mod ids;
pub mod marking;
pub mod value_codec;
pub mod walker;

pub use ciphertext::{BlobSubtype, Ciphertext};
pub use error::Error;
pub use ids::next_context_id;
pub use marking::{Algorithm, KeyRef, Marking};
pub use value_codec::{decode_value, encode_value};
pub use walker::{Filter, Walker};

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
