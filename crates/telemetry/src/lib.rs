//! Structured logging init and low-cardinality observability counters for
//! the collection-info cache and key broker.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error as ThisError;
use tracing_subscriber::EnvFilter;

/// Failures initializing the global logging subscriber.
#[derive(Debug, ThisError)]
pub enum TelemetryError {
    /// A subscriber was already installed for this process.
    #[error("global tracing subscriber already set")]
    AlreadyInitialized,
}

/// Install a JSON-formatted `tracing` subscriber, reading filter directives
/// from `RUST_LOG` (defaulting to `info`). Intended to be called once, near
/// process start, by the embedding application or the demo CLI.
pub fn init_json_logging() -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

/// Counters sampling the collection-info cache's activity.
#[derive(Default)]
pub struct CacheMetrics {
    fetches_owned: AtomicU64,
    waiter_wakeups: AtomicU64,
}

impl CacheMetrics {
    /// Construct a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that this process became the owner of a `listCollections`
    /// fetch.
    pub fn record_fetch_owned(&self) {
        self.fetches_owned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a waiter was woken by a cache entry completing.
    pub fn record_waiter_wakeup(&self) {
        self.waiter_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            fetches_owned: self.fetches_owned.load(Ordering::Relaxed),
            waiter_wakeups: self.waiter_wakeups.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSnapshot {
    /// Number of `listCollections` fetches this process owned.
    pub fetches_owned: u64,
    /// Number of waiter wakeups observed.
    pub waiter_wakeups: u64,
}

/// Counters sampling the key broker's activity.
#[derive(Default)]
pub struct BrokerMetrics {
    kms_round_trips: AtomicU64,
    keys_resolved: AtomicU64,
    keys_failed: AtomicU64,
}

impl BrokerMetrics {
    /// Construct a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that this process drove one KMS round trip to completion.
    pub fn record_kms_round_trip(&self) {
        self.kms_round_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a key finished in the `Decrypted` state.
    pub fn record_key_resolved(&self) {
        self.keys_resolved.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a key finished in the `Failed` state.
    pub fn record_key_failed(&self) {
        self.keys_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            kms_round_trips: self.kms_round_trips.load(Ordering::Relaxed),
            keys_resolved: self.keys_resolved.load(Ordering::Relaxed),
            keys_failed: self.keys_failed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read of [`BrokerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSnapshot {
    /// Number of KMS round trips this process drove to completion.
    pub kms_round_trips: u64,
    /// Number of keys resolved successfully.
    pub keys_resolved: u64,
    /// Number of keys that terminally failed.
    pub keys_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_metrics_accumulate() {
        let metrics = CacheMetrics::new();
        metrics.record_fetch_owned();
        metrics.record_fetch_owned();
        metrics.record_waiter_wakeup();
        let snap = metrics.snapshot();
        assert_eq!(snap.fetches_owned, 2);
        assert_eq!(snap.waiter_wakeups, 1);
    }

    #[test]
    fn broker_metrics_accumulate() {
        let metrics = BrokerMetrics::new();
        metrics.record_kms_round_trip();
        metrics.record_key_resolved();
        metrics.record_key_failed();
        let snap = metrics.snapshot();
        assert_eq!(snap.kms_round_trips, 1);
        assert_eq!(snap.keys_resolved, 1);
        assert_eq!(snap.keys_failed, 1);
    }
}
