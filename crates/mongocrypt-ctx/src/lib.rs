//! The context state machine for the field-level encryption driver core:
//! per-operation encrypt/decrypt/data-key contexts, the shared stores they
//! coordinate through, and the tagged-variant vtable the embedding
//! application drives them with.

#![deny(unsafe_code)]

mod base;
pub mod context;
pub mod datakey;
pub mod decrypt;
pub mod encrypt;
mod shared;
mod state;

pub use context::{AnyKmsContext, Context};
pub use datakey::{DataKeyContext, DataKeyKmsContext};
pub use decrypt::DecryptContext;
pub use encrypt::EncryptContext;
pub use shared::SharedStores;
pub use state::State;
