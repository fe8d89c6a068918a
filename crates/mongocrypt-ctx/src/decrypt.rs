//! Auto and explicit decrypt contexts: ciphertext discovery, key resolution,
//! and the finalize step that rewrites ciphertext blobs back to plaintext.

use bson::spec::BinarySubtype;
use bson::{doc, Bson, Document};
use fle_core::{Ciphertext, Error, Filter, Walker};
use key_broker::KeyRef as BrokerKeyRef;
use options::{ContextKind, ProvidedOpts};
use tracing::instrument;

use crate::base::Base;
use crate::shared::SharedStores;
use crate::state::State;

/// An auto or explicit decrypt operation in progress.
pub struct DecryptContext {
    base: Base,
    explicit: bool,
    original_doc: Document,
    decrypted_doc: Option<Document>,
    explicit_value: Option<Bson>,
}

impl DecryptContext {
    /// Start a non-explicit decrypt context over an arbitrary reply
    /// document: every ciphertext blob found anywhere in `doc` is requested
    /// from the key broker.
    pub fn init_auto(id: u32, shared: SharedStores, doc: Document, cache_noblock: bool) -> Result<Self, Error> {
        options::validate(ContextKind::Decrypt, ProvidedOpts::default())?;
        let mut base = Base::new(id, shared, cache_noblock);

        let mut parse_err = None;
        Walker::collect(&doc, Filter::Ciphertext, &mut |payload| {
            if parse_err.is_some() {
                return;
            }
            match Ciphertext::parse(payload) {
                Ok(blob) => match blob.key_uuid() {
                    Some(uuid) => base.key_broker.add_id(uuid),
                    None => parse_err = Some(Error::MalformedCiphertext("key uuid must be 16 bytes".to_string())),
                },
                Err(e) => parse_err = Some(e),
            }
        });
        if let Some(e) = parse_err {
            return Err(e);
        }

        let mut ctx = Self { base, explicit: false, original_doc: doc, decrypted_doc: None, explicit_value: None };
        ctx.base.state = ctx.base.state_from_key_broker();
        Ok(ctx)
    }

    /// Start an explicit decrypt context over a single `{v: <binary subtype
    /// 6>}` message.
    pub fn init_explicit(id: u32, shared: SharedStores, msg: Document, cache_noblock: bool) -> Result<Self, Error> {
        options::validate(ContextKind::Decrypt, ProvidedOpts::default())?;
        let value = msg.get("v").cloned().ok_or_else(|| Error::ClientInput("invalid msg, must contain 'v'".to_string()))?;
        let Bson::Binary(bin) = &value else {
            return Err(Error::ClientInput("v must be a binary subtype 6 ciphertext".to_string()));
        };
        if bin.subtype != BinarySubtype::Encrypted {
            return Err(Error::ClientInput("v must be a binary subtype 6 ciphertext".to_string()));
        }
        let blob = Ciphertext::parse(&bin.bytes)?;
        let key_uuid =
            blob.key_uuid().ok_or_else(|| Error::MalformedCiphertext("key uuid must be 16 bytes".to_string()))?;

        let mut base = Base::new(id, shared, cache_noblock);
        base.key_broker.add_id(key_uuid);
        let mut ctx = Self { base, explicit: true, original_doc: msg, decrypted_doc: None, explicit_value: Some(value) };
        ctx.base.state = ctx.base.state_from_key_broker();
        Ok(ctx)
    }

    /// Claim this context's pending key-vault fetch.
    pub fn mongo_op_keys(&mut self, out: &mut Vec<BrokerKeyRef>) -> bool {
        self.base.mongo_op_keys(out)
    }

    /// Feed back fetched key-vault documents.
    pub fn mongo_feed_keys(&mut self, docs: &[key_broker::KeyDocument]) -> bool {
        self.base.mongo_feed_keys(docs)
    }

    /// Finish this context's key-vault fetch.
    pub fn mongo_done_keys(&mut self) -> bool {
        self.base.mongo_done_keys()
    }

    /// Claim the next outstanding KMS round trip.
    pub fn next_kms_ctx(&mut self) -> Option<key_broker::KmsContext> {
        self.base.next_kms_ctx()
    }

    /// Report a KMS round trip's outcome.
    pub fn kms_done(&mut self, key_ref: &BrokerKeyRef, result: Result<Vec<u8>, String>) -> bool {
        self.base.kms_done(key_ref, result)
    }

    /// Block (or poll once, in `cache_noblock` mode) until the key broker
    /// makes further progress.
    pub fn wait_done(&mut self) -> bool {
        self.base.wait_done_key_broker()
    }

    /// Which peer context this one should wait on next, if any.
    pub fn next_dependent_ctx_id(&mut self) -> u32 {
        self.base.next_dependent_ctx_id_key_broker()
    }

    /// Replace every resolvable ciphertext blob with its plaintext value.
    /// A blob whose key never resolved is left unchanged: partial decryption
    /// is not an error.
    #[instrument(level = "debug", skip(self, out), fields(ctx_id = self.base.id))]
    pub fn finalize(&mut self, out: &mut Document) -> bool {
        if self.base.state != State::Ready {
            return false;
        }
        let result = if self.explicit { self.finalize_explicit() } else { self.finalize_auto() };
        match result {
            Ok(doc) => {
                self.decrypted_doc = Some(doc.clone());
                *out = doc;
                self.base.state = State::Done;
                true
            }
            Err(e) => self.base.fail(e),
        }
    }

    fn decrypt_ciphertext(&self, payload: &[u8]) -> Result<Bson, Error> {
        let blob = Ciphertext::parse(payload)?;
        let key_uuid = blob.key_uuid().ok_or_else(|| Error::MalformedCiphertext("key uuid must be 16 bytes".to_string()))?;
        let Some(material) = self.base.key_broker.decrypted_key_by_id(key_uuid) else {
            // Missing key material is not an error at decrypt time: leave the
            // ciphertext blob as-is and let the caller re-drive later.
            return Ok(Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Encrypted,
                bytes: blob.serialize(),
            }));
        };
        let algorithm = match blob.blob_subtype {
            fle_core::BlobSubtype::Deterministic => fle_core::Algorithm::Deterministic,
            fle_core::BlobSubtype::Random => fle_core::Algorithm::Random,
        };
        let value_bytes = self.base.shared.crypto.decrypt(&material, algorithm, &blob.ciphertext)?;
        fle_core::decode_value(blob.original_bson_type, &value_bytes)
    }

    fn finalize_auto(&self) -> Result<Document, Error> {
        Walker::transform(&self.original_doc, Filter::Ciphertext, &mut |payload| self.decrypt_ciphertext(payload))
    }

    fn finalize_explicit(&self) -> Result<Document, Error> {
        let Bson::Binary(bin) = self.explicit_value.as_ref().expect("explicit context always carries a value") else {
            return Err(Error::ClientInput("v must be a binary subtype 6 ciphertext".to_string()));
        };
        let plaintext = self.decrypt_ciphertext(&bin.bytes)?;
        Ok(doc! { "v": plaintext })
    }

    /// No process-wide resources to release for a decrypt context.
    pub fn cleanup(&mut self) {}

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.base.state()
    }

    /// The terminal failure, if this context is in `ERROR`.
    pub fn status(&self) -> Option<&Error> {
        self.base.status()
    }
}
