//! Process-wide stores and services every context is constructed against.

use std::sync::Arc;

use collinfo_cache::CollInfoCache;
use crypto_facade::CryptoProvider;
use key_broker::SharedKeyStore;
use telemetry::{BrokerMetrics, CacheMetrics};

/// The shared handles a context needs: the collection-info cache, the
/// process-wide key store, the crypto façade, and observability counters.
/// Constructed once by the embedding application and cloned (cheaply, via
/// `Arc`) into every context.
#[derive(Clone)]
pub struct SharedStores {
    /// The namespace-keyed collection-info cache.
    pub collinfo_cache: Arc<CollInfoCache>,
    /// The process-wide key store.
    pub key_store: Arc<SharedKeyStore>,
    /// The symmetric crypto primitive adapter.
    pub crypto: Arc<dyn CryptoProvider>,
    /// Cache activity counters.
    pub cache_metrics: Arc<CacheMetrics>,
    /// Key broker activity counters.
    pub broker_metrics: Arc<BrokerMetrics>,
}

impl SharedStores {
    /// Construct a fresh set of shared stores around `crypto`.
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            collinfo_cache: Arc::new(CollInfoCache::new()),
            key_store: Arc::new(SharedKeyStore::new()),
            crypto,
            cache_metrics: Arc::new(CacheMetrics::new()),
            broker_metrics: Arc::new(BrokerMetrics::new()),
        }
    }
}
