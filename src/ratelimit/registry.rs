//! Construction and caching of named limiters.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::limiter::RateLimiter;
use super::preset::{LimiterConfig, LimiterOptions};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::metrics::RateLimitMetrics;
use crate::store::{FailoverStore, RedisStore, StoreBackend};

/// Owner of every limiter in the process and of the store they share.
///
/// Construct one at startup, share it by `Arc`, and call
/// [`shutdown`](Self::shutdown) before exiting. The store is connected on
/// first use.
pub struct LimiterRegistry {
    store_config: StoreConfig,
    distributed: Option<Arc<dyn StoreBackend>>,
    store: OnceCell<Arc<FailoverStore>>,
    limiters: DashMap<String, Arc<RateLimiter>>,
    metrics: RateLimitMetrics,
}

impl LimiterRegistry {
    /// Create a registry using the store described by `store_config`.
    pub fn new(store_config: StoreConfig, metrics: RateLimitMetrics) -> Result<Self> {
        let distributed = match &store_config.redis_url {
            Some(url) => {
                let redis = RedisStore::new(url, Duration::from_millis(store_config.timeout_ms))?;
                Some(Arc::new(redis) as Arc<dyn StoreBackend>)
            }
            None => None,
        };
        Ok(Self::with_backend(store_config, distributed, metrics))
    }

    /// Create a registry over an explicit distributed backend.
    pub fn with_backend(
        store_config: StoreConfig,
        distributed: Option<Arc<dyn StoreBackend>>,
        metrics: RateLimitMetrics,
    ) -> Self {
        Self {
            store_config,
            distributed,
            store: OnceCell::new(),
            limiters: DashMap::new(),
            metrics,
        }
    }

    /// A registry that only uses process memory.
    pub fn local(metrics: RateLimitMetrics) -> Self {
        Self::with_backend(StoreConfig::default(), None, metrics)
    }

    /// Create the limiter `name`, or return it if it already exists.
    ///
    /// `options` are merged over the base preset and validated. A second
    /// call with the same name returns the cached instance untouched: its
    /// counters are kept and the new options are not validated.
    pub async fn create(&self, name: &str, options: LimiterOptions) -> Result<Arc<RateLimiter>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let store = self.store().await;

        match self.limiters.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let config = LimiterConfig::resolve(name, &options)?;
                info!(
                    limiter = %name,
                    points = config.points(),
                    duration_secs = config.duration_secs(),
                    block_duration_secs = config.block_duration_secs(),
                    distributed = store.is_distributed(),
                    "Limiter created"
                );
                let limiter = Arc::new(RateLimiter::new(config, store, self.metrics.clone()));
                entry.insert(limiter.clone());
                Ok(limiter)
            }
        }
    }

    /// Create every limiter in `limiters`, failing on the first invalid one.
    pub async fn create_all(&self, limiters: &BTreeMap<String, LimiterOptions>) -> Result<()> {
        for (name, options) in limiters {
            self.create(name, options.clone()).await?;
        }
        Ok(())
    }

    /// Get a previously created limiter.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|entry| entry.value().clone())
    }

    /// Names of all created limiters, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn metrics(&self) -> &RateLimitMetrics {
        &self.metrics
    }

    /// Release store connections and stop background tasks.
    pub async fn shutdown(&self) {
        if let Some(store) = self.store.get() {
            store.shutdown().await;
        }
        info!(limiters = self.limiters.len(), "Limiter registry shut down");
    }

    /// The shared store, connecting on first call.
    async fn store(&self) -> Arc<FailoverStore> {
        self.store
            .get_or_init(|| async {
                let store = FailoverStore::new(
                    self.distributed.clone(),
                    self.store_config.failure_policy,
                    Duration::from_millis(self.store_config.recovery_interval_ms),
                );

                if self.distributed.is_some() && !store.connect().await {
                    warn!(
                        policy = %self.store_config.failure_policy,
                        "Running without the distributed store until it recovers"
                    );
                } else if self.distributed.is_none() {
                    info!("No distributed store configured, budgets are per process");
                }

                store.start_sweeper(Duration::from_secs(self.store_config.sweep_interval_secs.max(1)));
                Arc::new(store)
            })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::ratelimit::Preset;
    use crate::store::FlakyStore;

    fn registry() -> LimiterRegistry {
        LimiterRegistry::local(RateLimitMetrics::new().unwrap())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = registry();
        assert!(registry.get("api").is_none());

        let limiter = registry.create("api", LimiterOptions::new()).await.unwrap();
        assert_eq!(limiter.config().points(), 100);

        let fetched = registry.get("api").unwrap();
        assert!(Arc::ptr_eq(&limiter, &fetched));
        assert_eq!(registry.names(), vec!["api".to_string()]);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_keeps_window() {
        let registry = registry();
        let options = LimiterOptions::new().points(3);

        let first = registry.create("api", options.clone()).await.unwrap();
        first.consume("client", 1).await;
        first.consume("client", 1).await;

        let second = registry.create("api", options).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let decision = second.consume("client", 1).await;
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 0);

        // Differing options on an existing name are ignored, not validated
        let third = registry
            .create("api", LimiterOptions::new().points(-1))
            .await
            .unwrap();
        assert_eq!(third.config().points(), 3);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_options_are_config_errors() {
        let registry = registry();
        let err = registry
            .create("api", LimiterOptions::new().duration_secs(0))
            .await
            .unwrap_err();

        assert!(matches!(err, TollgateError::Config(_)));
        assert!(registry.get("api").is_none());
    }

    #[tokio::test]
    async fn test_oversized_duration_is_config_error() {
        let registry = registry();
        let err = registry
            .create("api", LimiterOptions::new().duration_secs(i64::MAX / 10))
            .await
            .unwrap_err();

        assert!(matches!(err, TollgateError::Config(_)));
        assert!(registry.get("api").is_none());
    }

    #[tokio::test]
    async fn test_create_all_from_config() {
        let registry = registry();
        let mut limiters = BTreeMap::new();
        limiters.insert("login".to_string(), LimiterOptions::new().preset(Preset::Authentication));
        limiters.insert("webhook".to_string(), LimiterOptions::new());

        registry.create_all(&limiters).await.unwrap();

        assert_eq!(registry.names(), vec!["login".to_string(), "webhook".to_string()]);
        assert_eq!(registry.get("webhook").unwrap().config().points(), 50);
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_local() {
        let flaky = Arc::new(FlakyStore::new(false));
        let distributed: Arc<dyn StoreBackend> = flaky.clone();
        let registry = LimiterRegistry::with_backend(
            StoreConfig::default(),
            Some(distributed),
            RateLimitMetrics::new().unwrap(),
        );

        let limiter = registry
            .create("api", LimiterOptions::new().points(1))
            .await
            .unwrap();

        assert!(limiter.consume("client", 1).await.is_allowed());
        assert!(!limiter.consume("client", 1).await.is_allowed());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_failure_mid_run_keeps_deciding() {
        let flaky = Arc::new(FlakyStore::new(true));
        let distributed: Arc<dyn StoreBackend> = flaky.clone();
        let registry = LimiterRegistry::with_backend(
            StoreConfig::default(),
            Some(distributed),
            RateLimitMetrics::new().unwrap(),
        );
        let limiter = registry
            .create("api", LimiterOptions::new().points(2))
            .await
            .unwrap();
        assert!(limiter.consume("before", 1).await.is_allowed());

        flaky.set_up(false);

        for i in 0..3 {
            let decision = limiter.consume(&format!("new-{}", i), 1).await;
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), 1);
            assert_eq!(decision.limit(), 2);
        }

        registry.shutdown().await;
    }
}
