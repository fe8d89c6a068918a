//! Data-key creation: generate local key material, hand it off for a single
//! KMS wrap, and emit the key-vault document to insert.
//!
//! Unlike [`crate::encrypt::EncryptContext`]/[`crate::decrypt::DecryptContext`]
//! this context never touches the collinfo cache or the key broker — it
//! drives exactly one KMS round trip of its own, so it does not embed
//! [`crate::base::Base`].

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use fle_core::Error;
use options::{ContextKind, ProvidedOpts};
use tracing::instrument;
use uuid::Uuid;

use crate::shared::SharedStores;
use crate::state::State;

/// The one KMS round trip a data-key context asks its caller to drive: wrap
/// `plaintext_key_material` under `masterkey`.
#[derive(Debug, Clone)]
pub struct DataKeyKmsContext {
    /// The caller-supplied master key descriptor (KMS provider, region, key
    /// id, etc. — opaque to this crate).
    pub masterkey: Document,
    /// The freshly generated, still-unwrapped local key material.
    pub plaintext_key_material: Vec<u8>,
}

/// A data-key creation operation in progress.
pub struct DataKeyContext {
    id: u32,
    state: State,
    status: Option<Error>,
    shared: SharedStores,
    masterkey: Document,
    key_alt_names: Vec<Bson>,
    local_key_material: Vec<u8>,
    kms_claimed: bool,
    encrypted_key_material: Option<Vec<u8>>,
    key_doc: Option<Document>,
}

impl DataKeyContext {
    /// Start a data-key context: validates `masterkey` is present and
    /// everything else is absent, then generates local key material and
    /// moves straight to `NEED_KMS`.
    pub fn init(id: u32, shared: SharedStores, masterkey: Document, key_alt_names: Vec<Bson>) -> Result<Self, Error> {
        let opts = ProvidedOpts { masterkey: true, ..Default::default() };
        options::validate(ContextKind::CreateDataKey, opts)?;
        let local_key_material = shared.crypto.generate_data_key();
        Ok(Self {
            id,
            state: State::NeedKms,
            status: None,
            shared,
            masterkey,
            key_alt_names,
            local_key_material,
            kms_claimed: false,
            encrypted_key_material: None,
            key_doc: None,
        })
    }

    fn fail(&mut self, err: Error) -> bool {
        self.status = Some(err);
        self.state = State::Error;
        false
    }

    /// Claim the single outstanding KMS wrap, if not already claimed.
    pub fn next_kms_ctx(&mut self) -> Option<DataKeyKmsContext> {
        if self.state != State::NeedKms || self.kms_claimed {
            return None;
        }
        self.kms_claimed = true;
        Some(DataKeyKmsContext { masterkey: self.masterkey.clone(), plaintext_key_material: self.local_key_material.clone() })
    }

    /// Report the KMS wrap's outcome.
    #[instrument(level = "debug", skip(self, result), fields(ctx_id = self.id, ok = result.is_ok()))]
    pub fn kms_done(&mut self, result: Result<Vec<u8>, String>) -> bool {
        if self.state != State::NeedKms {
            return false;
        }
        match result {
            Ok(wrapped) => {
                self.shared.broker_metrics.record_kms_round_trip();
                self.shared.broker_metrics.record_key_resolved();
                self.encrypted_key_material = Some(wrapped);
                self.state = State::Ready;
                true
            }
            Err(e) => {
                self.shared.broker_metrics.record_kms_round_trip();
                self.shared.broker_metrics.record_key_failed();
                self.fail(Error::KeyBrokerFailure(e))
            }
        }
    }

    /// No peer coordination is needed for a fresh key: a data-key context
    /// never enters `WAITING`.
    pub fn wait_done(&mut self) -> bool {
        false
    }

    /// Always 0: a data-key context never depends on a peer context.
    pub fn next_dependent_ctx_id(&mut self) -> u32 {
        0
    }

    /// Emit the key-vault document to insert.
    #[instrument(level = "debug", skip(self, out), fields(ctx_id = self.id))]
    pub fn finalize(&mut self, out: &mut Document) -> bool {
        if self.state != State::Ready {
            return false;
        }
        let encrypted = self.encrypted_key_material.clone().expect("Ready state always carries wrapped material");
        let doc = doc! {
            "_id": Binary { subtype: BinarySubtype::Uuid, bytes: Uuid::new_v4().as_bytes().to_vec() },
            "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: encrypted },
            "masterKey": self.masterkey.clone(),
            "keyAltNames": self.key_alt_names.clone(),
        };
        self.key_doc = Some(doc.clone());
        *out = doc;
        self.state = State::Done;
        true
    }

    /// No process-wide resources to release for a data-key context.
    pub fn cleanup(&mut self) {}

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The terminal failure, if this context is in `ERROR`.
    pub fn status(&self) -> Option<&Error> {
        self.status.as_ref()
    }
}
