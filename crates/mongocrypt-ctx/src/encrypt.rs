//! Auto and explicit encrypt contexts: command-marking lookup, collinfo
//! coordination, and the finalize step that turns markings into ciphertext
//! blobs.

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use collinfo_cache::{Lookup, LookupState};
use fle_core::{Algorithm, Ciphertext, Error, Filter, KeyRef as MarkingKeyRef, Marking, Walker};
use key_broker::KeyRef as BrokerKeyRef;
use options::{ContextKind, ProvidedOpts};
use tracing::instrument;

use crate::base::Base;
use crate::shared::SharedStores;
use crate::state::State;

/// An auto or explicit encrypt operation in progress.
pub struct EncryptContext {
    base: Base,
    explicit: bool,
    ns: String,
    schema: Option<Document>,
    original_cmd: Document,
    marked_cmd: Option<Document>,
    encrypted_cmd: Option<Document>,
    collinfo_owner: u32,
    waiting_for_collinfo: bool,
    no_encryption_required: bool,
    explicit_key_ref: Option<MarkingKeyRef>,
    explicit_algorithm: Option<Algorithm>,
    explicit_iv: Option<[u8; 16]>,
    explicit_value: Option<Bson>,
}

impl EncryptContext {
    /// Start a non-explicit (schema-driven) encrypt context.
    pub fn init_auto(
        id: u32,
        shared: SharedStores,
        ns: String,
        cmd: Document,
        local_schema: Option<Document>,
        cache_noblock: bool,
    ) -> Result<Self, Error> {
        if !ns.contains('.') {
            return Err(Error::ClientInput("invalid ns, must contain a '.'".to_string()));
        }
        let opts = ProvidedOpts { schema: local_schema.is_some(), ..Default::default() };
        options::validate(ContextKind::EncryptAuto, opts)?;

        let base = Base::new(id, shared, cache_noblock);
        let mut ctx = Self {
            base,
            explicit: false,
            ns,
            schema: None,
            original_cmd: cmd,
            marked_cmd: None,
            encrypted_cmd: None,
            collinfo_owner: 0,
            waiting_for_collinfo: false,
            no_encryption_required: false,
            explicit_key_ref: None,
            explicit_algorithm: None,
            explicit_iv: None,
            explicit_value: None,
        };
        if let Some(schema) = local_schema {
            ctx.schema = Some(schema);
            ctx.base.state = State::NeedMongoMarkings;
        } else {
            ctx.try_collinfo_from_cache();
        }
        Ok(ctx)
    }

    /// Start an explicit, caller-addressed encrypt context.
    pub fn init_explicit(
        id: u32,
        shared: SharedStores,
        msg: Document,
        key_ref: MarkingKeyRef,
        algorithm: Algorithm,
        iv: Option<[u8; 16]>,
        cache_noblock: bool,
    ) -> Result<Self, Error> {
        let opts = ProvidedOpts { key_descriptor: true, algorithm: true, iv: iv.is_some(), ..Default::default() };
        options::validate(ContextKind::EncryptExplicit, opts)?;
        let value = msg.get("v").cloned().ok_or_else(|| Error::ClientInput("invalid msg, must contain 'v'".to_string()))?;

        let mut base = Base::new(id, shared, cache_noblock);
        match &key_ref {
            MarkingKeyRef::Id(uuid) => base.key_broker.add_id(*uuid),
            MarkingKeyRef::AltName(name) => base.key_broker.add_name(name),
        }
        let mut ctx = Self {
            base,
            explicit: true,
            ns: String::new(),
            schema: None,
            original_cmd: msg,
            marked_cmd: None,
            encrypted_cmd: None,
            collinfo_owner: 0,
            waiting_for_collinfo: false,
            no_encryption_required: false,
            explicit_key_ref: Some(key_ref),
            explicit_algorithm: Some(algorithm),
            explicit_iv: iv,
            explicit_value: Some(value),
        };
        ctx.base.state = ctx.base.state_from_key_broker();
        Ok(ctx)
    }

    /// Idempotent: attempt to resolve collinfo from the shared cache,
    /// landing on whichever of `NEED_MONGO_COLLINFO`/`WAITING` applies.
    fn try_collinfo_from_cache(&mut self) {
        let lookup = self.base.shared.collinfo_cache.get_or_create(&self.ns, self.base.id);
        self.apply_cache_lookup(lookup);
    }

    fn apply_cache_lookup(&mut self, lookup: Lookup) {
        match lookup.state {
            LookupState::Pending if lookup.owner == self.base.id => {
                self.base.shared.cache_metrics.record_fetch_owned();
                self.base.state = State::NeedMongoCollInfo;
            }
            LookupState::Pending => {
                self.collinfo_owner = lookup.owner;
                self.waiting_for_collinfo = true;
                self.base.state = State::Waiting;
            }
            LookupState::Done => {
                self.waiting_for_collinfo = false;
                let doc = lookup.doc.expect("Done lookup always carries a document");
                match self.apply_collinfo(&doc) {
                    Ok(()) => self.finish_collinfo(),
                    Err(e) => {
                        self.base.fail(e);
                    }
                }
            }
            LookupState::Failed => {
                self.base.fail(Error::CacheFailure(format!("collinfo fetch failed for {}", self.ns)));
            }
            LookupState::Gone => {
                let lookup = self.base.shared.collinfo_cache.get_or_create(&self.ns, self.base.id);
                self.apply_cache_lookup(lookup);
            }
        }
    }

    fn finish_collinfo(&mut self) {
        self.base.state =
            if self.schema.as_ref().map_or(true, Document::is_empty) { State::NothingToDo } else { State::NeedMongoMarkings };
    }

    fn apply_collinfo(&mut self, doc: &Document) -> Result<(), Error> {
        if doc.get_str("type").ok() == Some("view") {
            return Err(Error::ClientInput("cannot auto encrypt a view".to_string()));
        }
        let mut schema = None;
        if let Ok(options) = doc.get_document("options") {
            if let Ok(validator) = options.get_document("validator") {
                if let Some(js) = validator.get("$jsonSchema") {
                    if validator.len() > 1 {
                        return Err(Error::ClientInput(
                            "validator must not contain siblings of $jsonSchema".to_string(),
                        ));
                    }
                    match js {
                        Bson::Document(d) => schema = Some(d.clone()),
                        _ => return Err(Error::ClientInput("$jsonSchema must be a document".to_string())),
                    }
                }
            }
        }
        self.schema = schema;
        Ok(())
    }

    fn coll_name(&self) -> &str {
        self.ns.split_once('.').map_or("", |(_, coll)| coll)
    }

    /// Construct the `listCollections` filter body.
    #[instrument(level = "debug", skip(self, out), fields(ctx_id = self.base.id))]
    pub fn mongo_op_collinfo(&mut self, out: &mut Document) -> bool {
        if self.base.state != State::NeedMongoCollInfo {
            return false;
        }
        *out = doc! { "name": self.coll_name() };
        true
    }

    /// Feed back the `listCollections` reply.
    #[instrument(level = "debug", skip(self, reply), fields(ctx_id = self.base.id))]
    pub fn mongo_feed_collinfo(&mut self, reply: &Document) -> bool {
        if self.base.state != State::NeedMongoCollInfo {
            return false;
        }
        if let Err(e) = self.apply_collinfo(reply) {
            return self.base.fail(e);
        }
        if let Err(e) = self.base.shared.collinfo_cache.add_copy(&self.ns, reply.clone(), self.base.id) {
            return self.base.fail(e);
        }
        true
    }

    /// Finish the collinfo step: transition onward based on whether a schema
    /// was found.
    pub fn mongo_done_collinfo(&mut self) -> bool {
        if self.base.state != State::NeedMongoCollInfo {
            return false;
        }
        self.finish_collinfo();
        true
    }

    /// Construct the markings/query-analysis request body.
    pub fn mongo_op_markings(&mut self, out: &mut Document) -> bool {
        if self.base.state != State::NeedMongoMarkings {
            return false;
        }
        *out = doc! { "schema": self.schema.clone().unwrap_or_default() };
        true
    }

    /// Feed back the markings/query-analysis reply.
    #[instrument(level = "debug", skip(self, reply), fields(ctx_id = self.base.id))]
    pub fn mongo_feed_markings(&mut self, reply: &Document) -> bool {
        if self.base.state != State::NeedMongoMarkings {
            return false;
        }
        let requires_encryption =
            reply.get_bool("schemaRequiresEncryption").unwrap_or(true) && reply.get_bool("hasEncryptedPlaceholders").unwrap_or(true);
        if !requires_encryption {
            self.no_encryption_required = true;
            self.marked_cmd = Some(self.original_cmd.clone());
            return true;
        }
        let result = match reply.get_document("result") {
            Ok(r) => r.clone(),
            Err(_) => return self.base.fail(Error::ClientInput("markings reply missing 'result'".to_string())),
        };

        let mut parse_err = None;
        Walker::collect(&result, Filter::Marking, &mut |payload| {
            if parse_err.is_some() {
                return;
            }
            match Marking::parse(payload) {
                Ok(marking) => match &marking.key_ref {
                    MarkingKeyRef::Id(uuid) => self.base.key_broker.add_id(*uuid),
                    MarkingKeyRef::AltName(name) => self.base.key_broker.add_name(name),
                },
                Err(e) => parse_err = Some(e),
            }
        });
        if let Some(e) = parse_err {
            return self.base.fail(e);
        }
        self.marked_cmd = Some(result);
        true
    }

    /// Finish the markings step, transitioning onward per the key broker's
    /// aggregate progress.
    pub fn mongo_done_markings(&mut self) -> bool {
        if self.base.state != State::NeedMongoMarkings {
            return false;
        }
        self.base.state = if self.no_encryption_required { State::Ready } else { self.base.state_from_key_broker() };
        true
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

    /// Block (or poll once, in `cache_noblock` mode) until this context can
    /// make further progress.
    pub fn wait_done(&mut self) -> bool {
        if self.base.state == State::Waiting && self.waiting_for_collinfo {
            let lookup = if self.base.cache_noblock {
                self.base.shared.collinfo_cache.get_or_create(&self.ns, self.base.id)
            } else {
                self.base.shared.collinfo_cache.wait(&self.ns, None)
            };
            if !matches!(lookup.state, LookupState::Pending) {
                self.base.shared.cache_metrics.record_waiter_wakeup();
            }
            self.apply_cache_lookup(lookup);
            true
        } else {
            self.base.wait_done_key_broker()
        }
    }

    /// Which peer context this one should wait on next, if any.
    pub fn next_dependent_ctx_id(&mut self) -> u32 {
        if self.base.state == State::Waiting && self.waiting_for_collinfo {
            std::mem::take(&mut self.collinfo_owner)
        } else {
            self.base.next_dependent_ctx_id_key_broker()
        }
    }

    fn encrypt_marking(&self, marking: &Marking) -> Result<Bson, Error> {
        let key_ref = BrokerKeyRef::from_marking_ref(&marking.key_ref);
        let material = self
            .base
            .key_broker
            .decrypted_key_by_ref(&key_ref)
            .ok_or_else(|| Error::KeyBrokerFailure("key material not resolved".to_string()))?;
        let key_id = self
            .base
            .key_broker
            .resolved_key_id(&key_ref)
            .ok_or_else(|| Error::KeyBrokerFailure("key id not resolved".to_string()))?;
        let (bson_type, value_bytes) = fle_core::encode_value(marking.value());
        let ciphertext = self.base.shared.crypto.encrypt(&material, marking.algorithm, marking.iv, &value_bytes)?;
        let blob = Ciphertext::new_owned(marking.algorithm.into(), *key_id.as_bytes(), bson_type, ciphertext);
        Ok(Bson::Binary(Binary { subtype: BinarySubtype::Encrypted, bytes: blob.serialize() }))
    }

    /// Replace every marking with its encrypted ciphertext blob.
    #[instrument(level = "debug", skip(self, out), fields(ctx_id = self.base.id))]
    pub fn finalize(&mut self, out: &mut Document) -> bool {
        if self.base.state != State::Ready {
            return false;
        }
        let result = if self.explicit {
            self.finalize_explicit()
        } else {
            self.finalize_auto()
        };
        match result {
            Ok(doc) => {
                self.encrypted_cmd = Some(doc.clone());
                *out = doc;
                self.base.state = State::Done;
                true
            }
            Err(e) => self.base.fail(e),
        }
    }

    fn finalize_explicit(&self) -> Result<Document, Error> {
        let key_ref = self.explicit_key_ref.clone().expect("explicit context always carries a key ref");
        let algorithm = self.explicit_algorithm.expect("explicit context always carries an algorithm");
        let value = self.explicit_value.clone().expect("explicit context always carries a value");
        let marking = Marking::new(key_ref, algorithm, self.explicit_iv, value);
        let encrypted = self.encrypt_marking(&marking)?;
        Ok(doc! { "v": encrypted })
    }

    fn finalize_auto(&self) -> Result<Document, Error> {
        let marked = self.marked_cmd.clone().unwrap_or_else(|| self.original_cmd.clone());
        if self.no_encryption_required {
            return Ok(marked);
        }
        Walker::transform(&marked, Filter::Marking, &mut |payload| {
            let marking = Marking::parse(payload)?;
            self.encrypt_marking(&marking)
        })
    }

    /// Release this context's ownership of any pending collinfo entry.
    pub fn cleanup(&mut self) {
        self.base.shared.collinfo_cache.remove_by_owner(self.base.id);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.base.state()
    }

    /// The terminal failure, if this context is in `ERROR`.
    pub fn status(&self) -> Option<&Error> {
        self.base.status()
    }
}
