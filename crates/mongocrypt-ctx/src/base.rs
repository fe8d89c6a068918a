//! Fields and step logic shared by every context kind: id, state, status,
//! the key-broker view, and the key-broker-facing half of the vtable.

use fle_core::Error;
use key_broker::{BrokerProgress, KeyBroker, KeyDocument, KeyRef, KmsContext};
use tracing::instrument;

use crate::shared::SharedStores;
use crate::state::State;

pub(crate) struct Base {
    pub id: u32,
    pub state: State,
    pub status: Option<Error>,
    pub key_broker: KeyBroker,
    pub shared: SharedStores,
    pub cache_noblock: bool,
}

impl Base {
    pub fn new(id: u32, shared: SharedStores, cache_noblock: bool) -> Self {
        let key_broker = KeyBroker::new(shared.key_store.clone());
        Self { id, state: State::NothingToDo, status: None, key_broker, shared, cache_noblock }
    }

    /// Record a terminal failure and transition to `ERROR`. Always returns
    /// `false`, so call sites can `return self.base.fail(e)`.
    pub fn fail(&mut self, err: Error) -> bool {
        self.status = Some(err);
        self.state = State::Error;
        false
    }

    pub fn state_from_key_broker(&self) -> State {
        if self.key_broker.requested().is_empty() {
            return State::Ready;
        }
        match self.key_broker.progress() {
            BrokerProgress::NeedsMongoKeys => State::NeedMongoKeys,
            BrokerProgress::NeedsKms => State::NeedKms,
            BrokerProgress::Ready => State::Ready,
        }
    }

    #[instrument(level = "debug", skip(self, out), fields(ctx_id = self.id))]
    pub fn mongo_op_keys(&mut self, out: &mut Vec<KeyRef>) -> bool {
        if self.state != State::NeedMongoKeys {
            return false;
        }
        out.clear();
        out.extend(self.key_broker.op_keys(self.id));
        true
    }

    #[instrument(level = "debug", skip(self, docs), fields(ctx_id = self.id))]
    pub fn mongo_feed_keys(&mut self, docs: &[KeyDocument]) -> bool {
        if self.state != State::NeedMongoKeys {
            return false;
        }
        self.key_broker.feed_keys(docs, self.id);
        true
    }

    #[instrument(level = "debug", skip(self), fields(ctx_id = self.id))]
    pub fn mongo_done_keys(&mut self) -> bool {
        if self.state != State::NeedMongoKeys {
            return false;
        }
        self.key_broker.done_keys(self.id);
        self.state = self.state_from_key_broker();
        true
    }

    pub fn next_kms_ctx(&mut self) -> Option<KmsContext> {
        if self.state != State::NeedKms {
            return None;
        }
        self.key_broker.next_kms_ctx(self.id)
    }

    #[instrument(level = "debug", skip(self, key_ref, result), fields(ctx_id = self.id, ok = result.is_ok()))]
    pub fn kms_done(&mut self, key_ref: &KeyRef, result: Result<Vec<u8>, String>) -> bool {
        if self.state != State::NeedKms {
            return false;
        }
        if result.is_ok() {
            self.shared.broker_metrics.record_key_resolved();
        } else {
            self.shared.broker_metrics.record_key_failed();
        }
        self.shared.broker_metrics.record_kms_round_trip();
        self.key_broker.kms_done(key_ref, self.id, result);
        self.state = self.state_from_key_broker();
        true
    }

    /// Block (or, in `noblock` mode, poll once) until the key broker makes
    /// progress on this context's requested keys; used when `state` is
    /// `NeedMongoKeys` or `NeedKms` and the context itself has nothing left
    /// to actively drive (all of its claimable work is already claimed by
    /// a peer).
    pub fn wait_done_key_broker(&mut self) -> bool {
        if !matches!(self.state, State::NeedMongoKeys | State::NeedKms) {
            return false;
        }
        if self.key_broker.check_cache_and_wait(!self.cache_noblock) {
            self.state = self.state_from_key_broker();
        }
        true
    }

    pub fn next_dependent_ctx_id_key_broker(&self) -> u32 {
        match self.state {
            State::NeedMongoKeys | State::NeedKms => self.key_broker.next_ctx_id(self.id),
            _ => 0,
        }
    }

    pub fn status(&self) -> Option<&Error> {
        self.status.as_ref()
    }

    pub fn state(&self) -> State {
        self.state
    }
}
