/*!
 * The coordinator: named registries of primitives, reporting, and strategy tuning
 *
 * An `Optimizer` is an explicit value; callers share it (typically behind an `Arc`)
 * rather than reaching for a global. Each registry is its own lock, and no registry
 * lock is held while a primitive is being used.
 */

use bulwark_core_resilience::{
    BatchConfig, BatchHandle, BatchProcessor, Cache, CacheConfig, CircuitBreaker,
    CircuitBreakerConfig, Connection, ConnectionPool, PoolConfig, SharedBatchFn,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{OptimizerConfig, StrategyLimits};
use crate::error::{GuardedCallError, InstanceKind, OptimizerError, Result};
use crate::report::OptimizerReport;
use crate::strategy::{Adjustment, AdjustmentKind, OptimizationStrategy};

/// Cache type held by the coordinator
pub type ValueCache = Cache<String, Value>;

/// Batch processor type held by the coordinator
pub type ValueBatchProcessor = BatchProcessor<Value, Value>;

/// Batch function accepted by [`Optimizer::submit_batched`]
pub type ValueBatchFn = SharedBatchFn<Value, Value>;

type Registry<T> = RwLock<HashMap<String, T>>;

/// Owns named primitives and tunes them as a group
#[derive(Debug)]
pub struct Optimizer {
    strategy: RwLock<OptimizationStrategy>,
    limits: StrategyLimits,
    breakers: Registry<CircuitBreaker>,
    pools: Registry<Arc<ConnectionPool>>,
    caches: Registry<Arc<ValueCache>>,
    batch_processors: Registry<Arc<ValueBatchProcessor>>,
    adjustments: RwLock<Vec<Adjustment>>,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new(OptimizationStrategy::default(), StrategyLimits::default())
    }
}

impl Optimizer {
    /// Create an empty coordinator
    pub fn new(strategy: OptimizationStrategy, limits: StrategyLimits) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            limits,
            breakers: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
            batch_processors: RwLock::new(HashMap::new()),
            adjustments: RwLock::new(Vec::new()),
        }
    }

    /// Build a coordinator with every configured instance registered and its
    /// background task running
    pub async fn with_config(config: &OptimizerConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = Self::new(config.strategy, config.limits.clone());

        for breaker in &config.breakers {
            optimizer
                .register_breaker(&breaker.name, CircuitBreakerConfig::from(breaker))
                .await?;
        }
        for pool in &config.pools {
            optimizer
                .register_pool(&pool.name, PoolConfig::from(pool))
                .await?;
        }
        for cache in &config.caches {
            optimizer
                .register_cache(&cache.name, CacheConfig::from(cache))
                .await?;
        }
        for batch in &config.batch_processors {
            optimizer
                .register_batch_processor(&batch.name, BatchConfig::from(batch))
                .await?;
        }

        info!(
            strategy = %config.strategy,
            breakers = config.breakers.len(),
            pools = config.pools.len(),
            caches = config.caches.len(),
            batch_processors = config.batch_processors.len(),
            "optimizer initialized"
        );
        Ok(optimizer)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub async fn register_breaker(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<CircuitBreaker> {
        let mut breakers = self.breakers.write().await;
        ensure_vacant(&breakers, InstanceKind::CircuitBreaker, name)?;
        let breaker = CircuitBreaker::new(name, config);
        breakers.insert(name.to_string(), breaker.clone());
        info!(breaker = name, "registered circuit breaker");
        Ok(breaker)
    }

    /// Register a pool and start its health check
    pub async fn register_pool(&self, name: &str, config: PoolConfig) -> Result<Arc<ConnectionPool>> {
        config.validate()?;
        let pool = {
            let mut pools = self.pools.write().await;
            ensure_vacant(&pools, InstanceKind::ConnectionPool, name)?;
            let pool = Arc::new(ConnectionPool::new(name, config));
            pools.insert(name.to_string(), pool.clone());
            pool
        };
        pool.start_health_check().await;
        info!(pool = name, "registered connection pool");
        Ok(pool)
    }

    /// Register a cache and start its expiry sweep
    pub async fn register_cache(&self, name: &str, config: CacheConfig) -> Result<Arc<ValueCache>> {
        config.validate()?;
        let cache = {
            let mut caches = self.caches.write().await;
            ensure_vacant(&caches, InstanceKind::Cache, name)?;
            let cache = Arc::new(ValueCache::new(name, config));
            caches.insert(name.to_string(), cache.clone());
            cache
        };
        cache.start_expiry_sweep().await;
        info!(cache = name, "registered cache");
        Ok(cache)
    }

    /// Register a batch processor and start its timeout scanner
    pub async fn register_batch_processor(
        &self,
        name: &str,
        config: BatchConfig,
    ) -> Result<Arc<ValueBatchProcessor>> {
        config.validate()?;
        let processor = {
            let mut processors = self.batch_processors.write().await;
            ensure_vacant(&processors, InstanceKind::BatchProcessor, name)?;
            let processor = Arc::new(ValueBatchProcessor::new(name, config));
            processors.insert(name.to_string(), processor.clone());
            processor
        };
        processor.start_scanner().await;
        info!(processor = name, "registered batch processor");
        Ok(processor)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub async fn breaker(&self, name: &str) -> Result<CircuitBreaker> {
        lookup(&self.breakers, InstanceKind::CircuitBreaker, name).await
    }

    pub async fn pool(&self, name: &str) -> Result<Arc<ConnectionPool>> {
        lookup(&self.pools, InstanceKind::ConnectionPool, name).await
    }

    pub async fn cache(&self, name: &str) -> Result<Arc<ValueCache>> {
        lookup(&self.caches, InstanceKind::Cache, name).await
    }

    pub async fn batch_processor(&self, name: &str) -> Result<Arc<ValueBatchProcessor>> {
        lookup(&self.batch_processors, InstanceKind::BatchProcessor, name).await
    }

    // ------------------------------------------------------------------
    // Call surface
    // ------------------------------------------------------------------

    /// Run `op` behind the named breaker.
    ///
    /// An open breaker rejects without running `op`; otherwise `op`'s own error is
    /// returned unchanged after being recorded.
    pub async fn guarded_call<F, Fut, T, E>(
        &self,
        breaker: &str,
        op: F,
    ) -> std::result::Result<T, GuardedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let breaker = self.breaker(breaker).await?;
        Ok(breaker.execute(op).await?)
    }

    /// Like [`Self::guarded_call`], but runs `fallback` when the breaker is open or the
    /// primary call fails. If the fallback fails too, the primary error is returned.
    pub async fn guarded_call_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        breaker: &str,
        op: F,
        fallback: G,
    ) -> std::result::Result<T, GuardedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let breaker = self.breaker(breaker).await?;
        match breaker.execute(op).await {
            Ok(value) => Ok(value),
            Err(primary) => {
                debug!(breaker = breaker.name(), error = %primary, "primary call failed, trying fallback");
                match fallback().await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        warn!(breaker = breaker.name(), error = %e, "fallback failed");
                        Err(primary.into())
                    }
                }
            }
        }
    }

    /// Serve `key` from the named cache, or run `op` behind the named breaker and cache
    /// the success value.
    ///
    /// A cached value that does not deserialize as `T` is treated as a miss.
    pub async fn cached_call<F, Fut, T, E>(
        &self,
        breaker: &str,
        cache: &str,
        key: &str,
        op: F,
    ) -> std::result::Result<T, GuardedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        T: Serialize + DeserializeOwned,
    {
        let cache = self.cache(cache).await?;
        if let Some(hit) = cache.get(key).await {
            match serde_json::from_value::<T>(hit) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(cache = cache.name(), key, error = %e, "cached value has unexpected shape")
                }
            }
        }

        let value = self.guarded_call(breaker, op).await?;
        match serde_json::to_value(&value) {
            Ok(json) => {
                cache.put(key.to_string(), json).await;
            }
            Err(e) => warn!(cache = cache.name(), key, error = %e, "result not cacheable"),
        }
        Ok(value)
    }

    /// Acquire a handle from the named pool, bounded by `timeout`
    pub async fn acquire_connection(&self, pool: &str, timeout: Duration) -> Result<Connection> {
        let pool = self.pool(pool).await?;
        Ok(pool.acquire_timeout(timeout).await?)
    }

    pub async fn release_connection(&self, pool: &str, conn: Connection) -> Result<()> {
        let pool = self.pool(pool).await?;
        Ok(pool.release(conn).await?)
    }

    pub async fn cache_get(&self, cache: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.cache(cache).await?.get(key).await)
    }

    /// Write to the named cache; `ttl` defaults to the cache's current default
    pub async fn cache_put(
        &self,
        cache: &str,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let cache = self.cache(cache).await?;
        Ok(match ttl {
            Some(ttl) => cache.put_with_ttl(key.into(), value, ttl).await,
            None => cache.put(key.into(), value).await,
        })
    }

    pub async fn submit_batched(
        &self,
        processor: &str,
        batch_key: impl Into<String>,
        payload: Value,
        function: ValueBatchFn,
    ) -> Result<BatchHandle<Value>> {
        let processor = self.batch_processor(processor).await?;
        Ok(processor.submit(batch_key, payload, function).await)
    }

    // ------------------------------------------------------------------
    // Reporting and tuning
    // ------------------------------------------------------------------

    pub async fn strategy(&self) -> OptimizationStrategy {
        *self.strategy.read().await
    }

    pub fn limits(&self) -> &StrategyLimits {
        &self.limits
    }

    /// Every tuning pass applied so far, oldest first
    pub async fn adjustments(&self) -> Vec<Adjustment> {
        self.adjustments.read().await.clone()
    }

    /// Snapshot statistics for every registered instance
    pub async fn report(&self) -> OptimizerReport {
        let mut breakers = BTreeMap::new();
        for (name, breaker) in snapshot(&self.breakers).await {
            breakers.insert(name, breaker.stats().await);
        }
        let mut pools = BTreeMap::new();
        for (name, pool) in snapshot(&self.pools).await {
            pools.insert(name, pool.stats().await);
        }
        let mut caches = BTreeMap::new();
        for (name, cache) in snapshot(&self.caches).await {
            caches.insert(name, cache.stats().await);
        }
        let mut processors = BTreeMap::new();
        for (name, processor) in snapshot(&self.batch_processors).await {
            processors.insert(name, processor.stats().await);
        }

        let applied = self.adjustments.read().await.len();
        OptimizerReport::new(
            self.strategy().await,
            breakers,
            pools,
            caches,
            processors,
            applied,
        )
    }

    /// Re-tune every owned instance toward `strategy` and log the pass.
    ///
    /// Passes are serialized; each instance's change is applied under its own lock.
    pub async fn apply_strategy(&self, strategy: OptimizationStrategy) -> Result<Adjustment> {
        let mut log = self.adjustments.write().await;

        let adjustment = match strategy {
            OptimizationStrategy::Latency => {
                let changed = self.tune_for_latency().await;
                Adjustment::new(
                    AdjustmentKind::LatencyOptimization,
                    "Optimized all components for minimum latency",
                    changed,
                )
            }
            OptimizationStrategy::Resource => {
                let changed = self.tune_for_resources().await;
                Adjustment::new(
                    AdjustmentKind::ResourceOptimization,
                    "Optimized all components for resource conservation",
                    changed,
                )
            }
            OptimizationStrategy::Balanced => {
                return Err(OptimizerError::InvalidStrategy(format!(
                    "'{}' has no tuning pass; use latency or resource",
                    strategy
                )))
            }
        };

        *self.strategy.write().await = strategy;
        info!(
            strategy = %strategy,
            instances_changed = adjustment.instances_changed,
            "applied optimization strategy"
        );
        log.push(adjustment.clone());
        Ok(adjustment)
    }

    async fn tune_for_latency(&self) -> usize {
        let mut changed = 0;

        for (name, cache) in snapshot(&self.caches).await {
            let current = cache.config().await.default_ttl;
            let target = self.limits.latency_cache_ttl(current);
            if target != current {
                cache.set_default_ttl(target).await;
                debug!(cache = %name, from = ?current, to = ?target, "lowered cache ttl");
                changed += 1;
            }
        }

        for (name, processor) in snapshot(&self.batch_processors).await {
            let current = processor.config().await.batch_timeout;
            let target = self.limits.latency_batch_timeout(current);
            if target != current {
                processor.set_batch_timeout(target).await;
                debug!(processor = %name, from = ?current, to = ?target, "lowered batch timeout");
                changed += 1;
            }
        }

        for (name, pool) in snapshot(&self.pools).await {
            let current = pool.config().await.max_connections;
            let target = self.limits.latency_pool_max(current);
            if target != current && pool.set_max_connections(target).await != current {
                debug!(pool = %name, from = current, to = target, "raised pool maximum");
                changed += 1;
            }
        }

        changed
    }

    async fn tune_for_resources(&self) -> usize {
        let mut changed = 0;

        for (name, cache) in snapshot(&self.caches).await {
            let current = cache.config().await.max_size;
            let target = self.limits.resource_cache_size(current);
            if target != current {
                let evicted = cache.set_max_size(target).await;
                debug!(cache = %name, from = current, to = target, evicted, "shrunk cache");
                changed += 1;
            }
        }

        for (name, processor) in snapshot(&self.batch_processors).await {
            let current = processor.config().await.batch_size;
            let target = self.limits.resource_batch_size(current);
            if target != current {
                processor.set_batch_size(target).await;
                debug!(processor = %name, from = current, to = target, "raised batch size");
                changed += 1;
            }
        }

        for (name, pool) in snapshot(&self.pools).await {
            let current = pool.config().await.max_connections;
            let target = self.limits.resource_pool_max(current);
            if target != current && pool.set_max_connections(target).await != current {
                debug!(pool = %name, from = current, to = target, "lowered pool maximum");
                changed += 1;
            }
        }

        changed
    }

    /// Stop every background task. Pending batches are run to completion.
    pub async fn shutdown(&self) {
        for (_, pool) in snapshot(&self.pools).await {
            pool.shutdown().await;
        }
        for (_, cache) in snapshot(&self.caches).await {
            cache.shutdown().await;
        }
        for (_, processor) in snapshot(&self.batch_processors).await {
            processor.shutdown().await;
        }
        info!("optimizer shut down");
    }
}

fn ensure_vacant<T>(map: &HashMap<String, T>, kind: InstanceKind, name: &str) -> Result<()> {
    if map.contains_key(name) {
        return Err(OptimizerError::AlreadyRegistered {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

async fn lookup<T: Clone>(registry: &Registry<T>, kind: InstanceKind, name: &str) -> Result<T> {
    registry
        .read()
        .await
        .get(name)
        .cloned()
        .ok_or_else(|| OptimizerError::UnknownInstance {
            kind,
            name: name.to_string(),
        })
}

/// Clone the registry's entries so no registry lock is held while instances are used
async fn snapshot<T: Clone>(registry: &Registry<T>) -> Vec<(String, T)> {
    registry
        .read()
        .await
        .iter()
        .map(|(name, item)| (name.clone(), item.clone()))
        .collect()
}
