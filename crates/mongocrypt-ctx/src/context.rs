//! The tagged-variant vtable: one `Context` enum dispatching to whichever
//! concrete context kind is active, rather than a dynamic vtable of
//! callbacks. A given [`State`] only admits certain operations; calling an
//! inapplicable one is a no-op that returns `false`/`None` and logs at
//! `debug`, never panics.

use bson::Document;
use fle_core::Error;
use key_broker::{KeyDocument, KeyRef};
use tracing::debug;

use crate::datakey::{DataKeyContext, DataKeyKmsContext};
use crate::decrypt::DecryptContext;
use crate::encrypt::EncryptContext;
use crate::state::State;

/// A single outstanding KMS round trip, however the owning context shapes
/// it: decrypting an existing key (encrypt/decrypt contexts, via the shared
/// key broker) or wrapping a freshly generated one (data-key contexts).
#[derive(Debug, Clone)]
pub enum AnyKmsContext {
    /// A key-broker-owned round trip: decrypt `encrypted_key_material` for
    /// `key_ref`.
    KeyBroker(key_broker::KmsContext),
    /// A data-key context's one-shot wrap of freshly generated material.
    DataKey(DataKeyKmsContext),
}

/// One end-to-end encrypt, decrypt, or data-key-creation operation.
pub enum Context {
    /// An auto or explicit encrypt operation.
    Encrypt(EncryptContext),
    /// An auto or explicit decrypt operation.
    Decrypt(DecryptContext),
    /// A data-key creation operation.
    DataKey(DataKeyContext),
}

impl Context {
    /// Construct the `listCollections` filter body (encrypt contexts only).
    pub fn mongo_op_collinfo(&mut self, out: &mut Document) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_op_collinfo(out),
            _ => not_applicable("mongo_op_collinfo"),
        }
    }

    /// Feed back the `listCollections` reply (encrypt contexts only).
    pub fn mongo_feed_collinfo(&mut self, reply: &Document) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_feed_collinfo(reply),
            _ => not_applicable("mongo_feed_collinfo"),
        }
    }

    /// Finish the collinfo step (encrypt contexts only).
    pub fn mongo_done_collinfo(&mut self) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_done_collinfo(),
            _ => not_applicable("mongo_done_collinfo"),
        }
    }

    /// Construct the markings/query-analysis request body (encrypt contexts
    /// only).
    pub fn mongo_op_markings(&mut self, out: &mut Document) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_op_markings(out),
            _ => not_applicable("mongo_op_markings"),
        }
    }

    /// Feed back the markings/query-analysis reply (encrypt contexts only).
    pub fn mongo_feed_markings(&mut self, reply: &Document) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_feed_markings(reply),
            _ => not_applicable("mongo_feed_markings"),
        }
    }

    /// Finish the markings step (encrypt contexts only).
    pub fn mongo_done_markings(&mut self) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_done_markings(),
            _ => not_applicable("mongo_done_markings"),
        }
    }

    /// Claim this context's pending key-vault fetch (encrypt/decrypt only).
    pub fn mongo_op_keys(&mut self, out: &mut Vec<KeyRef>) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_op_keys(out),
            Self::Decrypt(c) => c.mongo_op_keys(out),
            Self::DataKey(_) => not_applicable("mongo_op_keys"),
        }
    }

    /// Feed back fetched key-vault documents (encrypt/decrypt only).
    pub fn mongo_feed_keys(&mut self, docs: &[KeyDocument]) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_feed_keys(docs),
            Self::Decrypt(c) => c.mongo_feed_keys(docs),
            Self::DataKey(_) => not_applicable("mongo_feed_keys"),
        }
    }

    /// Finish this context's key-vault fetch (encrypt/decrypt only).
    pub fn mongo_done_keys(&mut self) -> bool {
        match self {
            Self::Encrypt(c) => c.mongo_done_keys(),
            Self::Decrypt(c) => c.mongo_done_keys(),
            Self::DataKey(_) => not_applicable("mongo_done_keys"),
        }
    }

    /// Claim the next outstanding KMS round trip, whichever shape this
    /// context's kind produces.
    pub fn next_kms_ctx(&mut self) -> Option<AnyKmsContext> {
        match self {
            Self::Encrypt(c) => c.next_kms_ctx().map(AnyKmsContext::KeyBroker),
            Self::Decrypt(c) => c.next_kms_ctx().map(AnyKmsContext::KeyBroker),
            Self::DataKey(c) => c.next_kms_ctx().map(AnyKmsContext::DataKey),
        }
    }

    /// Report a KMS round trip's outcome. A mismatch between this context's
    /// kind and `kms_ctx`'s shape is a no-op.
    pub fn kms_done(&mut self, kms_ctx: &AnyKmsContext, result: Result<Vec<u8>, String>) -> bool {
        match (self, kms_ctx) {
            (Self::Encrypt(c), AnyKmsContext::KeyBroker(k)) => c.kms_done(&k.key_ref, result),
            (Self::Decrypt(c), AnyKmsContext::KeyBroker(k)) => c.kms_done(&k.key_ref, result),
            (Self::DataKey(c), AnyKmsContext::DataKey(_)) => c.kms_done(result),
            _ => not_applicable("kms_done"),
        }
    }

    /// Block (or poll once) until this context can make further progress.
    pub fn wait_done(&mut self) -> bool {
        match self {
            Self::Encrypt(c) => c.wait_done(),
            Self::Decrypt(c) => c.wait_done(),
            Self::DataKey(c) => c.wait_done(),
        }
    }

    /// Which peer context this one should wait on next, if any (0 if none).
    pub fn next_dependent_ctx_id(&mut self) -> u32 {
        match self {
            Self::Encrypt(c) => c.next_dependent_ctx_id(),
            Self::Decrypt(c) => c.next_dependent_ctx_id(),
            Self::DataKey(c) => c.next_dependent_ctx_id(),
        }
    }

    /// Produce this context's final output document.
    pub fn finalize(&mut self, out: &mut Document) -> bool {
        match self {
            Self::Encrypt(c) => c.finalize(out),
            Self::Decrypt(c) => c.finalize(out),
            Self::DataKey(c) => c.finalize(out),
        }
    }

    /// Release any process-wide resources this context owns (cache
    /// ownership, outstanding claims). Idempotent; safe in `ERROR`.
    pub fn cleanup(&mut self) {
        match self {
            Self::Encrypt(c) => c.cleanup(),
            Self::Decrypt(c) => c.cleanup(),
            Self::DataKey(c) => c.cleanup(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        match self {
            Self::Encrypt(c) => c.state(),
            Self::Decrypt(c) => c.state(),
            Self::DataKey(c) => c.state(),
        }
    }

    /// The terminal failure, if this context is in `ERROR`.
    pub fn status(&self) -> Option<&Error> {
        match self {
            Self::Encrypt(c) => c.status(),
            Self::Decrypt(c) => c.status(),
            Self::DataKey(c) => c.status(),
        }
    }
}

fn not_applicable(op: &'static str) -> bool {
    debug!(op, "vtable operation not applicable to this context kind/state");
    false
}
