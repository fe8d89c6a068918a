//! The process-wide key store and the per-context broker view over it.
//!
//! A key is referenced either by id or by alt-name. Many contexts may
//! reference the same key concurrently; the shared store guarantees that,
//! for each key, the mongo key-document fetch and the KMS round trip each
//! happen at most once across the whole process, while every context that
//! asked for the key observes the same eventual `Decrypted` or `Failed`
//! state.
//!
//! State per key: `NeedsFetch → Fetching → NeedsKms → Decrypting → Decrypted
//! | Failed`. `NeedsFetch`/`NeedsKms` are unowned; `Fetching`/`Decrypting`
//! are claimed by exactly one context id until that context reports
//! progress.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use bson::Bson;
use fle_core::{Error, KeyRef as MarkingKeyRef};
use tracing::{debug, warn};
use uuid::Uuid;

/// A hashable reference to a key: by id, or by the canonical BSON encoding
/// of its alt-name (`bson::Bson` does not implement `Hash`, so the encoded
/// bytes stand in for it).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyRef {
    /// Direct key id.
    Id(Uuid),
    /// Alt-name, encoded to canonical BSON bytes for hashing/equality.
    AltName(Vec<u8>),
}

impl KeyRef {
    /// Build a broker key reference from the marking codec's key reference.
    pub fn from_marking_ref(r: &MarkingKeyRef) -> Self {
        match r {
            MarkingKeyRef::Id(id) => Self::Id(*id),
            MarkingKeyRef::AltName(name) => {
                Self::AltName(encode_alt_name(name))
            }
        }
    }

    /// Build a broker key reference directly from an alt-name value.
    pub fn from_alt_name(name: &Bson) -> Self {
        Self::AltName(encode_alt_name(name))
    }
}

fn encode_alt_name(name: &Bson) -> Vec<u8> {
    let doc = bson::doc! { "ka": name.clone() };
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes).expect("bson document always serializes");
    bytes
}

/// One fetched key-vault document, carrying the still-encrypted key
/// material (decryption happens externally via KMS).
#[derive(Debug, Clone)]
pub struct KeyDocument {
    /// The key's id.
    pub key_id: Uuid,
    /// Any alt-names registered on the key document.
    pub key_alt_names: Vec<Bson>,
    /// The encrypted key material blob, as stored in the key vault.
    pub encrypted_key_material: Vec<u8>,
}

/// One outstanding KMS round trip the embedding driver must perform.
#[derive(Debug, Clone)]
pub struct KmsContext {
    /// Which key this round trip resolves.
    pub key_ref: KeyRef,
    /// The encrypted key material to send to KMS.
    pub encrypted_key_material: Vec<u8>,
}

#[derive(Debug, Clone)]
enum KeyState {
    NeedsFetch,
    Fetching { owner: u32 },
    NeedsKms { key_id: Uuid, encrypted_key_material: Vec<u8> },
    Decrypting { owner: u32, key_id: Uuid, encrypted_key_material: Vec<u8> },
    Decrypted { key_id: Uuid, material: Arc<[u8]> },
    Failed(String),
}

/// Which kind of mongo/KMS work remains for a set of requested keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerProgress {
    /// Every requested key has reached a terminal state.
    Ready,
    /// At least one key still needs a key-vault fetch.
    NeedsMongoKeys,
    /// Every key has been fetched; at least one still needs a KMS round
    /// trip.
    NeedsKms,
}

/// Process-wide shared key store.
#[derive(Default)]
pub struct SharedKeyStore {
    inner: Mutex<HashMap<KeyRef, KeyState>>,
    condvar: Condvar,
}

impl SharedKeyStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()), condvar: Condvar::new() }
    }

    fn ensure_locked(map: &mut HashMap<KeyRef, KeyState>, key: &KeyRef) {
        map.entry(key.clone()).or_insert(KeyState::NeedsFetch);
    }

    /// Idempotent insertion: make sure `key` has an entry, without changing
    /// an existing one.
    pub fn ensure(&self, key: &KeyRef) {
        let mut map = self.inner.lock().expect("key store mutex poisoned");
        Self::ensure_locked(&mut map, key);
    }

    /// Claim every `NeedsFetch` key among `keys` for `ctx_id`, transitioning
    /// each to `Fetching`. Returns the claimed keys, to be looked up in the
    /// key vault by the caller.
    pub fn claim_fetch(&self, keys: &[KeyRef], ctx_id: u32) -> Vec<KeyRef> {
        let mut map = self.inner.lock().expect("key store mutex poisoned");
        let mut claimed = Vec::new();
        for key in keys {
            Self::ensure_locked(&mut map, key);
            if matches!(map.get(key), Some(KeyState::NeedsFetch)) {
                map.insert(key.clone(), KeyState::Fetching { owner: ctx_id });
                claimed.push(key.clone());
            }
        }
        if !claimed.is_empty() {
            debug!(ctx_id, count = claimed.len(), "claimed key-vault fetch");
        }
        claimed
    }

    /// Feed back key-vault documents fetched by `ctx_id`, moving the
    /// matching `Fetching` entries to `NeedsKms`.
    pub fn feed_documents(&self, docs: &[KeyDocument], ctx_id: u32) {
        let mut map = self.inner.lock().expect("key store mutex poisoned");
        for doc in docs {
            let mut refs = vec![KeyRef::Id(doc.key_id)];
            refs.extend(doc.key_alt_names.iter().map(KeyRef::from_alt_name));
            for key_ref in refs {
                if matches!(map.get(&key_ref), Some(KeyState::Fetching { owner }) if *owner == ctx_id) {
                    map.insert(
                        key_ref,
                        KeyState::NeedsKms {
                            key_id: doc.key_id,
                            encrypted_key_material: doc.encrypted_key_material.clone(),
                        },
                    );
                }
            }
        }
        self.condvar.notify_all();
    }

    /// Called once `ctx_id`'s key-vault query is exhausted: any of its
    /// still-`Fetching` entries had no matching document and are terminally
    /// unresolved.
    pub fn done_fetch(&self, keys: &[KeyRef], ctx_id: u32) {
        let mut map = self.inner.lock().expect("key store mutex poisoned");
        for key in keys {
            if matches!(map.get(key), Some(KeyState::Fetching { owner }) if *owner == ctx_id) {
                warn!(ctx_id, "key vault fetch finished without resolving a claimed key");
                map.insert(key.clone(), KeyState::Failed("key not found".to_string()));
            }
        }
        self.condvar.notify_all();
    }

    /// Claim one `NeedsKms` entry among `keys` for `ctx_id`.
    pub fn next_kms_ctx(&self, keys: &[KeyRef], ctx_id: u32) -> Option<KmsContext> {
        let mut map = self.inner.lock().expect("key store mutex poisoned");
        for key in keys {
            if let Some(KeyState::NeedsKms { key_id, encrypted_key_material }) = map.get(key) {
                let key_id = *key_id;
                let encrypted_key_material = encrypted_key_material.clone();
                map.insert(
                    key.clone(),
                    KeyState::Decrypting { owner: ctx_id, key_id, encrypted_key_material: encrypted_key_material.clone() },
                );
                return Some(KmsContext { key_ref: key.clone(), encrypted_key_material });
            }
        }
        None
    }

    /// Report the outcome of a KMS round trip claimed by `ctx_id`.
    pub fn kms_done(&self, key: &KeyRef, ctx_id: u32, result: Result<Vec<u8>, String>) {
        let mut map = self.inner.lock().expect("key store mutex poisoned");
        if let Some(KeyState::Decrypting { owner, key_id, .. }) = map.get(key) {
            if *owner == ctx_id {
                let key_id = *key_id;
                let new_state = match result {
                    Ok(material) => KeyState::Decrypted { key_id, material: Arc::from(material) },
                    Err(e) => KeyState::Failed(e),
                };
                map.insert(key.clone(), new_state);
                self.condvar.notify_all();
            }
        }
    }

    fn is_terminal(map: &HashMap<KeyRef, KeyState>, key: &KeyRef) -> bool {
        matches!(map.get(key), Some(KeyState::Decrypted { .. }) | Some(KeyState::Failed(_)))
    }

    /// Which phase of work remains for `keys`: at least one still needs a
    /// key-vault fetch, all are fetched but at least one needs KMS, or all
    /// are terminal.
    pub fn progress(&self, keys: &[KeyRef]) -> BrokerProgress {
        let map = self.inner.lock().expect("key store mutex poisoned");
        let mut needs_kms = false;
        for key in keys {
            match map.get(key) {
                Some(KeyState::NeedsFetch) | Some(KeyState::Fetching { .. }) | None => {
                    return BrokerProgress::NeedsMongoKeys
                }
                Some(KeyState::NeedsKms { .. }) | Some(KeyState::Decrypting { .. }) => needs_kms = true,
                Some(KeyState::Decrypted { .. }) | Some(KeyState::Failed(_)) => {}
            }
        }
        if needs_kms {
            BrokerProgress::NeedsKms
        } else {
            BrokerProgress::Ready
        }
    }

    /// The resolved key id for `key`, once its key-vault document has been
    /// fetched (available from `NeedsKms` onward).
    pub fn resolved_key_id(&self, key: &KeyRef) -> Option<Uuid> {
        let map = self.inner.lock().expect("key store mutex poisoned");
        match map.get(key) {
            Some(KeyState::NeedsKms { key_id, .. })
            | Some(KeyState::Decrypting { key_id, .. })
            | Some(KeyState::Decrypted { key_id, .. }) => Some(*key_id),
            _ => None,
        }
    }

    /// Whether every key in `keys` has reached a terminal state
    /// (`Decrypted` or `Failed`).
    pub fn all_terminal(&self, keys: &[KeyRef]) -> bool {
        let map = self.inner.lock().expect("key store mutex poisoned");
        keys.iter().all(|k| Self::is_terminal(&map, k))
    }

    /// Block until every key in `keys` reaches a terminal state.
    pub fn wait_all_terminal(&self, keys: &[KeyRef]) {
        let map = self.inner.lock().expect("key store mutex poisoned");
        let _guard = self
            .condvar
            .wait_while(map, |map| !keys.iter().all(|k| Self::is_terminal(map, k)))
            .expect("key store mutex poisoned");
    }

    /// The owner of an in-flight `Fetching`/`Decrypting` entry among `keys`,
    /// if any is currently owned by a context other than `self_ctx_id`.
    pub fn next_dependent_ctx_id(&self, keys: &[KeyRef], self_ctx_id: u32) -> u32 {
        let map = self.inner.lock().expect("key store mutex poisoned");
        for key in keys {
            match map.get(key) {
                Some(KeyState::Fetching { owner }) | Some(KeyState::Decrypting { owner, .. })
                    if *owner != self_ctx_id =>
                {
                    return *owner
                }
                _ => {}
            }
        }
        0
    }

    /// Decrypted material for `key`, or `None` if it is not present or not
    /// yet decrypted (not an error at decrypt time: partial decryption is
    /// permitted).
    pub fn decrypted_material(&self, key: &KeyRef) -> Option<Arc<[u8]>> {
        let map = self.inner.lock().expect("key store mutex poisoned");
        match map.get(key) {
            Some(KeyState::Decrypted { material, .. }) => Some(Arc::clone(material)),
            _ => None,
        }
    }

    /// The first terminal failure among `keys`, if any.
    pub fn first_failure(&self, keys: &[KeyRef]) -> Option<String> {
        let map = self.inner.lock().expect("key store mutex poisoned");
        keys.iter().find_map(|k| match map.get(k) {
            Some(KeyState::Failed(e)) => Some(e.clone()),
            _ => None,
        })
    }
}

/// Per-context view over the shared key store: tracks which keys this
/// context has referenced, in the order the walker discovered them.
pub struct KeyBroker {
    shared: Arc<SharedKeyStore>,
    requested: Vec<KeyRef>,
}

impl KeyBroker {
    /// Construct a broker view over `shared`.
    pub fn new(shared: Arc<SharedKeyStore>) -> Self {
        Self { shared, requested: Vec::new() }
    }

    /// Reference a key by id, idempotently.
    pub fn add_id(&mut self, id: Uuid) {
        self.add_ref(KeyRef::Id(id));
    }

    /// Reference a key by alt-name, idempotently.
    pub fn add_name(&mut self, alt_name: &Bson) {
        self.add_ref(KeyRef::from_alt_name(alt_name));
    }

    fn add_ref(&mut self, key_ref: KeyRef) {
        if !self.requested.contains(&key_ref) {
            self.shared.ensure(&key_ref);
            self.requested.push(key_ref);
        }
    }

    /// The keys this context has referenced, in discovery order.
    pub fn requested(&self) -> &[KeyRef] {
        &self.requested
    }

    /// Claim this context's `NeedsFetch` keys for a key-vault query.
    pub fn op_keys(&self, ctx_id: u32) -> Vec<KeyRef> {
        self.shared.claim_fetch(&self.requested, ctx_id)
    }

    /// Feed back key-vault documents for this context's claimed keys.
    pub fn feed_keys(&self, docs: &[KeyDocument], ctx_id: u32) {
        self.shared.feed_documents(docs, ctx_id);
    }

    /// Finish this context's key-vault query, failing any keys that went
    /// unresolved.
    pub fn done_keys(&self, ctx_id: u32) {
        self.shared.done_fetch(&self.requested, ctx_id);
    }

    /// Claim the next KMS round trip among this context's keys.
    pub fn next_kms_ctx(&self, ctx_id: u32) -> Option<KmsContext> {
        self.shared.next_kms_ctx(&self.requested, ctx_id)
    }

    /// Report a KMS round trip's outcome.
    pub fn kms_done(&self, key_ref: &KeyRef, ctx_id: u32, result: Result<Vec<u8>, String>) {
        self.shared.kms_done(key_ref, ctx_id, result);
    }

    /// Attempt to complete every requested key via the shared store. In
    /// blocking mode, waits until all reach a terminal state; in
    /// non-blocking mode, reports current progress without waiting.
    pub fn check_cache_and_wait(&self, block: bool) -> bool {
        if block {
            self.shared.wait_all_terminal(&self.requested);
        }
        self.shared.all_terminal(&self.requested)
    }

    /// The ctx id this context should wait on next, or 0 if none of its
    /// requested keys are owned by a peer.
    pub fn next_ctx_id(&self, self_ctx_id: u32) -> u32 {
        self.shared.next_dependent_ctx_id(&self.requested, self_ctx_id)
    }

    /// Which phase of work remains for this context's requested keys.
    pub fn progress(&self) -> BrokerProgress {
        self.shared.progress(&self.requested)
    }

    /// The resolved key id for a broker key reference, once fetched.
    pub fn resolved_key_id(&self, key_ref: &KeyRef) -> Option<Uuid> {
        self.shared.resolved_key_id(key_ref)
    }

    /// Decrypted material for a key id, if available.
    pub fn decrypted_key_by_id(&self, id: Uuid) -> Option<Arc<[u8]>> {
        self.shared.decrypted_material(&KeyRef::Id(id))
    }

    /// Decrypted material for a broker key reference, if available.
    pub fn decrypted_key_by_ref(&self, key_ref: &KeyRef) -> Option<Arc<[u8]>> {
        self.shared.decrypted_material(key_ref)
    }

    /// Surface the first terminal failure among this context's requested
    /// keys, if any.
    pub fn status(&self) -> Result<(), Error> {
        match self.shared.first_failure(&self.requested) {
            Some(e) => Err(Error::KeyBrokerFailure(e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fetch_across_two_contexts() {
        let shared = Arc::new(SharedKeyStore::new());
        let mut a = KeyBroker::new(Arc::clone(&shared));
        let mut b = KeyBroker::new(Arc::clone(&shared));
        let id = Uuid::from_bytes([1u8; 16]);
        a.add_id(id);
        b.add_id(id);

        let claimed_a = a.op_keys(1);
        assert_eq!(claimed_a, vec![KeyRef::Id(id)]);
        let claimed_b = b.op_keys(2);
        assert!(claimed_b.is_empty(), "second context must not reclaim an in-flight fetch");

        a.feed_keys(
            &[KeyDocument { key_id: id, key_alt_names: vec![], encrypted_key_material: vec![9, 9] }],
            1,
        );
        assert_eq!(b.next_kms_ctx(2).unwrap().key_ref, KeyRef::Id(id));
        b.kms_done(&KeyRef::Id(id), 2, Ok(vec![1, 2, 3]));

        assert!(a.check_cache_and_wait(false));
        assert_eq!(a.decrypted_key_by_id(id).unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(a.progress(), BrokerProgress::Ready);
    }

    #[test]
    fn progress_tracks_phase() {
        let shared = Arc::new(SharedKeyStore::new());
        let mut broker = KeyBroker::new(Arc::clone(&shared));
        let id = Uuid::from_bytes([5u8; 16]);
        broker.add_id(id);
        assert_eq!(broker.progress(), BrokerProgress::NeedsMongoKeys);

        broker.op_keys(1);
        broker.feed_keys(&[KeyDocument { key_id: id, key_alt_names: vec![], encrypted_key_material: vec![1] }], 1);
        assert_eq!(broker.progress(), BrokerProgress::NeedsKms);
        assert_eq!(broker.resolved_key_id(&KeyRef::Id(id)), Some(id));

        let kms = broker.next_kms_ctx(1).unwrap();
        broker.kms_done(&kms.key_ref, 1, Ok(vec![9; 32]));
        assert_eq!(broker.progress(), BrokerProgress::Ready);
    }

    #[test]
    fn missing_key_is_not_an_error_for_lookup() {
        let shared = Arc::new(SharedKeyStore::new());
        let broker = KeyBroker::new(shared);
        assert!(broker.decrypted_key_by_id(Uuid::from_bytes([2u8; 16])).is_none());
    }

    #[test]
    fn unresolved_fetch_surfaces_as_failure() {
        let shared = Arc::new(SharedKeyStore::new());
        let mut broker = KeyBroker::new(Arc::clone(&shared));
        let id = Uuid::from_bytes([4u8; 16]);
        broker.add_id(id);
        broker.op_keys(1);
        broker.done_keys(1);
        assert!(broker.status().is_err());
    }
}
