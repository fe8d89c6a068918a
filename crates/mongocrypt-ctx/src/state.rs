//! The context state machine's states.

/// Where a context currently sits in its lifecycle. Each state admits only
/// a subset of the vtable operations exposed by [`crate::Context`]; calling
/// an inapplicable one is a no-op that returns `false` without changing
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// A step failed; `status()` carries the recorded error. Terminal.
    Error,
    /// The operation requires no further work (e.g. an empty schema).
    /// Terminal.
    NothingToDo,
    /// The caller must perform a `listCollections` fetch and feed the reply
    /// back via `mongo_feed_collinfo`/`mongo_done_collinfo`.
    NeedMongoCollInfo,
    /// The caller must invoke the markings/query-analysis service and feed
    /// the reply back via `mongo_feed_markings`/`mongo_done_markings`.
    NeedMongoMarkings,
    /// The caller must fetch key-vault documents for the keys this context
    /// referenced and feed them back via `mongo_feed_keys`/`mongo_done_keys`.
    NeedMongoKeys,
    /// The caller must drive KMS round trips via `next_kms_ctx`/`kms_done`
    /// until none remain.
    NeedKms,
    /// Waiting on a peer context (collinfo ownership or key broker
    /// progress); call `wait_done`.
    Waiting,
    /// All inputs resolved; call `finalize`.
    Ready,
    /// `finalize` has run. Terminal.
    Done,
}

impl State {
    /// Whether this state has no further transitions (absent explicit
    /// `cleanup`, which is valid from any state).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::NothingToDo | Self::Done)
    }
}
