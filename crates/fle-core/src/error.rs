//! The single error type shared by every crate in this workspace.
//!
//! Each variant corresponds to one of the error kinds named in the driver
//! design: client-supplied input is rejected, a wire format failed to parse,
//! the external crypto primitive failed, or one of the shared stores
//! (collection-info cache, key broker) could not make progress.

use thiserror::Error as ThisError;

/// Errors surfaced by the field-level encryption driver core.
#[derive(Debug, Clone, ThisError, PartialEq, Eq)]
pub enum Error {
    /// The caller supplied invalid arguments: a malformed namespace, an
    /// explicit message missing `v`, an options-matrix violation, or a view
    /// collection where auto-encryption was requested.
    #[error("{0}")]
    ClientInput(String),

    /// A BSON document could not be interpreted the way a step required.
    #[error("malformed bson: {0}")]
    MalformedBson(String),

    /// A ciphertext blob failed to parse.
    #[error("malformed ciphertext, {0}")]
    MalformedCiphertext(String),

    /// A marking document failed to parse.
    #[error("malformed marking, {0}")]
    MalformedMarking(String),

    /// The external crypto primitive reported a failure.
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// The key broker could not resolve a key or reported a terminal KMS
    /// failure.
    #[error("key broker failure: {0}")]
    KeyBrokerFailure(String),

    /// The collection-info cache reported a terminal failure for an owned
    /// fetch.
    #[error("cache failure: {0}")]
    CacheFailure(String),
}
