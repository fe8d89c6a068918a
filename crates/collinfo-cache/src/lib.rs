//! The namespace-keyed collection-info cache: single-fetcher coordination so
//! that only one context per namespace ever issues the out-of-band
//! `listCollections` call, while its peers wait on the shared entry.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use fle_core::Error;
use tracing::{debug, warn};

enum Entry {
    Pending { owner: u32 },
    Done(bson::Document),
    Failed(String),
}

/// The state of a cache entry as observed by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    /// Some context owns the in-flight fetch.
    Pending,
    /// The fetch completed; a document is available.
    Done,
    /// The owning context's fetch failed.
    Failed,
    /// A waiter was woken because the owner it was waiting on disappeared
    /// (cleaned up without finishing). Nobody owns the namespace now; the
    /// caller must re-poll [`CollInfoCache::get_or_create`] to either become
    /// the new owner or observe whoever gets there first.
    Gone,
}

/// The result of a cache query.
#[derive(Debug, Clone)]
pub struct Lookup {
    /// Which state the entry is in.
    pub state: LookupState,
    /// The owning context id, meaningful only when `state == Pending`.
    pub owner: u32,
    /// A copy of the collection-info document, present only when
    /// `state == Done`.
    pub doc: Option<bson::Document>,
}

/// Process-wide cache, shared by construction across every context that
/// might touch the same namespaces.
#[derive(Default)]
pub struct CollInfoCache {
    inner: Mutex<HashMap<String, Entry>>,
    condvar: Condvar,
}

impl CollInfoCache {
    /// Construct an empty cache.
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()), condvar: Condvar::new() }
    }

    /// Atomically look up `key`, creating a `Pending` entry owned by
    /// `ctx_id` if none exists yet.
    pub fn get_or_create(&self, key: &str, ctx_id: u32) -> Lookup {
        let mut map = self.inner.lock().expect("collinfo cache mutex poisoned");
        match map.get(key) {
            None => {
                map.insert(key.to_string(), Entry::Pending { owner: ctx_id });
                debug!(namespace = key, ctx_id, "collinfo fetch owner assigned");
                Lookup { state: LookupState::Pending, owner: ctx_id, doc: None }
            }
            Some(Entry::Pending { owner }) => {
                Lookup { state: LookupState::Pending, owner: *owner, doc: None }
            }
            Some(Entry::Done(doc)) => Lookup { state: LookupState::Done, owner: 0, doc: Some(doc.clone()) },
            Some(Entry::Failed(_)) => Lookup { state: LookupState::Failed, owner: 0, doc: None },
        }
    }

    /// Complete a `Pending` entry this context owns. Returns an error if
    /// `ctx_id` is not the current owner (a stale or already-removed
    /// context); the entry is left untouched in that case.
    pub fn add_copy(&self, key: &str, doc: bson::Document, ctx_id: u32) -> Result<(), Error> {
        let mut map = self.inner.lock().expect("collinfo cache mutex poisoned");
        match map.get(key) {
            Some(Entry::Pending { owner }) if *owner == ctx_id => {
                map.insert(key.to_string(), Entry::Done(doc));
                self.condvar.notify_all();
                Ok(())
            }
            _ => Err(Error::CacheFailure(format!("context {ctx_id} is not the owner of {key}"))),
        }
    }

    /// Fail a `Pending` entry this context owns, waking peers so one of
    /// them can take over via [`CollInfoCache::get_or_create`].
    pub fn fail(&self, key: &str, ctx_id: u32, message: String) -> Result<(), Error> {
        let mut map = self.inner.lock().expect("collinfo cache mutex poisoned");
        match map.get(key) {
            Some(Entry::Pending { owner }) if *owner == ctx_id => {
                map.remove(key);
                self.condvar.notify_all();
                Ok(())
            }
            _ => Err(Error::CacheFailure(format!("context {ctx_id} is not the owner of {key} (message: {message})"))),
        }
    }

    /// Block until `key`'s entry is no longer `Pending`, or `timeout`
    /// elapses. Used only when `cache_noblock` is false; in `noblock` mode
    /// callers re-poll via [`CollInfoCache::get_or_create`] instead.
    pub fn wait(&self, key: &str, timeout: Option<Duration>) -> Lookup {
        let map = self.inner.lock().expect("collinfo cache mutex poisoned");
        let still_pending = |map: &HashMap<String, Entry>| matches!(map.get(key), Some(Entry::Pending { .. }));
        let map = match timeout {
            None => self.condvar.wait_while(map, still_pending).expect("collinfo cache mutex poisoned"),
            Some(d) => {
                let (guard, _timed_out) =
                    self.condvar.wait_timeout_while(map, d, still_pending).expect("collinfo cache mutex poisoned");
                guard
            }
        };
        match map.get(key) {
            None => Lookup { state: LookupState::Gone, owner: 0, doc: None },
            Some(Entry::Pending { owner }) => Lookup { state: LookupState::Pending, owner: *owner, doc: None },
            Some(Entry::Done(doc)) => Lookup { state: LookupState::Done, owner: 0, doc: Some(doc.clone()) },
            Some(Entry::Failed(_)) => Lookup { state: LookupState::Failed, owner: 0, doc: None },
        }
    }

    /// Remove every `Pending` entry owned by `ctx_id` (context cleanup),
    /// waking peers so one of them becomes the new owner.
    pub fn remove_by_owner(&self, ctx_id: u32) {
        let mut map = self.inner.lock().expect("collinfo cache mutex poisoned");
        let had_pending = map.values().any(|entry| matches!(entry, Entry::Pending { owner } if *owner == ctx_id));
        map.retain(|_, entry| !matches!(entry, Entry::Pending { owner } if *owner == ctx_id));
        if had_pending {
            warn!(ctx_id, "owner cleaned up without completing a pending collinfo fetch");
        }
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_caller_becomes_owner() {
        let cache = CollInfoCache::new();
        let lookup = cache.get_or_create("db.coll", 1);
        assert_eq!(lookup.state, LookupState::Pending);
        assert_eq!(lookup.owner, 1);
    }

    #[test]
    fn second_caller_observes_existing_owner() {
        let cache = CollInfoCache::new();
        cache.get_or_create("db.coll", 1);
        let lookup = cache.get_or_create("db.coll", 2);
        assert_eq!(lookup.state, LookupState::Pending);
        assert_eq!(lookup.owner, 1);
    }

    #[test]
    fn add_copy_requires_ownership() {
        let cache = CollInfoCache::new();
        cache.get_or_create("db.coll", 1);
        assert!(cache.add_copy("db.coll", bson::doc! {}, 2).is_err());
        assert!(cache.add_copy("db.coll", bson::doc! { "name": "coll" }, 1).is_ok());
        let lookup = cache.get_or_create("db.coll", 3);
        assert_eq!(lookup.state, LookupState::Done);
        assert_eq!(lookup.doc.unwrap().get_str("name").unwrap(), "coll");
    }

    #[test]
    fn remove_by_owner_frees_entry_for_new_owner() {
        let cache = CollInfoCache::new();
        cache.get_or_create("db.coll", 1);
        cache.remove_by_owner(1);
        let lookup = cache.get_or_create("db.coll", 2);
        assert_eq!(lookup.state, LookupState::Pending);
        assert_eq!(lookup.owner, 2);
    }

    #[test]
    fn waiter_is_released_on_owner_failure_instead_of_reparking() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(CollInfoCache::new());
        cache.get_or_create("db.coll", 1);

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.wait("db.coll", Some(Duration::from_secs(5))))
        };

        cache.remove_by_owner(1);
        let result = waiter.join().unwrap();
        assert_eq!(result.state, LookupState::Gone);

        let lookup = cache.get_or_create("db.coll", 2);
        assert_eq!(lookup.state, LookupState::Pending);
        assert_eq!(lookup.owner, 2);
    }

    #[test]
    fn concurrent_waiter_sees_completion() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(CollInfoCache::new());
        let a = cache.get_or_create("db.coll", 1);
        assert_eq!(a.state, LookupState::Pending);
        let b = cache.get_or_create("db.coll", 2);
        assert_eq!(b.owner, 1);

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.wait("db.coll", Some(Duration::from_secs(5))))
        };

        cache.add_copy("db.coll", bson::doc! { "name": "coll" }, 1).unwrap();
        let result = waiter.join().unwrap();
        assert_eq!(result.state, LookupState::Done);
    }
}
