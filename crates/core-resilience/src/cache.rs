//! TTL cache with pluggable eviction
//!
//! Every entry carries an expiry instant. Reads that land on or after the expiry drop the
//! entry and report a miss, so a present entry is always live. When a new key arrives at
//! capacity, exactly one entry is evicted according to the configured [`EvictionPolicy`].
//! A periodic sweep removes expired entries that nobody reads anymore.
//!
//! Recency and insertion order are tracked with a per-cache logical sequence rather than
//! wall-clock timestamps, so two accesses within the same clock tick still order correctly.

use super::error::ResilienceError;
use super::periodic::PeriodicTask;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Which entry to remove when a new key arrives at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum EvictionPolicy {
    /// Least recently accessed
    #[default]
    Lru,
    /// Fewest accesses; ties go to the earliest inserted
    Lfu,
    /// Earliest inserted, regardless of access
    Fifo,
}

impl EvictionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "LRU",
            EvictionPolicy::Lfu => "LFU",
            EvictionPolicy::Fifo => "FIFO",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(EvictionPolicy::Lru),
            "LFU" => Ok(EvictionPolicy::Lfu),
            "FIFO" => Ok(EvictionPolicy::Fifo),
            other => Err(ResilienceError::InvalidConfig(format!(
                "unknown eviction policy '{}'",
                other
            ))),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_size: usize,
    /// TTL applied when `put` is called without one
    pub default_ttl: Duration,
    pub eviction_policy: EvictionPolicy,
    /// Period of the background expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(300),
            eviction_policy: EvictionPolicy::Lru,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// A zero capacity is allowed and rejects every write
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.default_ttl.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "default_ttl must be non-zero".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "cleanup_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Estimates the footprint of one entry, in bytes
pub type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> usize + Send + Sync>;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    last_access: u64,
    access_count: u64,
    inserted: u64,
    size_bytes: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct CacheState<K, V> {
    config: CacheConfig,
    entries: HashMap<K, CacheEntry<V>>,
    sequence: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<K, V> CacheState<K, V>
where
    K: Eq + Hash + Clone,
{
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn select_victim(&self) -> Option<K> {
        let entries = self.entries.iter();
        let victim = match self.config.eviction_policy {
            EvictionPolicy::Lru => entries.min_by_key(|(_, e)| e.last_access),
            EvictionPolicy::Lfu => entries.min_by_key(|(_, e)| (e.access_count, e.inserted)),
            EvictionPolicy::Fifo => entries.min_by_key(|(_, e)| e.inserted),
        };
        victim.map(|(k, _)| k.clone())
    }

    fn evict_one(&mut self, cache: &str) -> bool {
        match self.select_victim() {
            Some(key) => {
                self.entries.remove(&key);
                self.evictions += 1;
                debug!(cache, policy = %self.config.eviction_policy, "evicted entry");
                true
            }
            None => false,
        }
    }

    fn evict_to(&mut self, limit: usize, cache: &str) -> usize {
        let mut evicted = 0;
        while self.entries.len() > limit && self.evict_one(cache) {
            evicted += 1;
        }
        evicted
    }

    fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        self.expirations += removed as u64;
        removed
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CacheStats {
    pub name: String,
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    /// Share of capacity in use (0.0 - 1.0)
    pub utilization: f64,
    pub eviction_policy: EvictionPolicy,
    pub default_ttl_secs: f64,
    /// Sum of per-entry size estimates
    pub memory_bytes: usize,
}

/// A concurrent TTL cache
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{Cache, CacheConfig, EvictionPolicy};
///
/// # async fn example() {
/// let cache: Cache<String, String> = Cache::new(
///     "conversation_context",
///     CacheConfig {
///         max_size: 200,
///         eviction_policy: EvictionPolicy::Lru,
///         ..Default::default()
///     },
/// );
///
/// cache.put("session-1".to_string(), "hello".to_string()).await;
/// assert_eq!(cache.get("session-1").await.as_deref(), Some("hello"));
/// # }
/// ```
pub struct Cache<K, V> {
    name: Arc<str>,
    state: Arc<Mutex<CacheState<K, V>>>,
    weigher: Weigher<K, V>,
    sweep_task: Mutex<Option<PeriodicTask>>,
}

impl<K, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache that estimates entry size from the key and value types
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self::with_weigher(
            name,
            config,
            Arc::new(|_: &K, _: &V| std::mem::size_of::<K>() + std::mem::size_of::<V>()),
        )
    }

    /// Create a cache with a caller-supplied entry size estimate
    pub fn with_weigher(name: impl Into<String>, config: CacheConfig, weigher: Weigher<K, V>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        debug!(
            cache = %name,
            max_size = config.max_size,
            ttl_secs = config.default_ttl.as_secs(),
            policy = %config.eviction_policy,
            "cache initialized"
        );
        Self {
            name,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::with_capacity(config.max_size.min(1024)),
                config,
                sequence: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            })),
            weigher,
            sweep_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the periodic expiry sweep; a no-op if it is already running
    pub async fn start_expiry_sweep(&self) {
        let mut slot = self.sweep_task.lock().await;
        if slot.is_some() {
            return;
        }

        let interval = self.state.lock().await.config.cleanup_interval;
        let state = self.state.clone();
        let name = self.name.clone();
        *slot = Some(PeriodicTask::spawn(
            format!("{}-expiry-sweep", self.name),
            interval,
            move || {
                let state = state.clone();
                let name = name.clone();
                async move {
                    let removed = state.lock().await.purge_expired();
                    if removed > 0 {
                        debug!(cache = %name, removed, "swept expired entries");
                    }
                    Ok(())
                }
            },
        ));
    }

    /// Stop the background sweep
    pub async fn shutdown(&self) {
        let task = self.sweep_task.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Look up a live value. Expired entries are dropped and reported as a miss.
    pub async fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.entries.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        state.sequence += 1;
        let sequence = state.sequence;
        let entry = state.entries.get_mut(key)?;
        entry.last_access = sequence;
        entry.access_count += 1;
        state.hits += 1;
        Some(entry.value.clone())
    }

    /// Insert with the default TTL
    pub async fn put(&self, key: K, value: V) -> bool {
        let ttl = self.state.lock().await.config.default_ttl;
        self.put_with_ttl(key, value, ttl).await
    }

    /// Insert or refresh an entry.
    ///
    /// A refreshed key keeps its original insertion position for FIFO purposes. Returns
    /// false only when the cache has no capacity at all.
    pub async fn put_with_ttl(&self, key: K, value: V, ttl: Duration) -> bool {
        let size_bytes = (self.weigher)(&key, &value);
        let mut state = self.state.lock().await;

        if state.config.max_size == 0 {
            return false;
        }

        let now = Instant::now();
        let sequence = state.next_sequence();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.value = value;
            entry.created_at = now;
            entry.expires_at = now + ttl;
            entry.last_access = sequence;
            entry.access_count += 1;
            entry.size_bytes = size_bytes;
            return true;
        }

        if state.entries.len() >= state.config.max_size {
            state.evict_one(&self.name);
        }

        state.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                last_access: sequence,
                access_count: 1,
                inserted: sequence,
                size_bytes,
            },
        );
        true
    }

    /// Remove a key; absent keys are a no-op. Returns whether anything was removed.
    pub async fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().await.entries.remove(key).is_some()
    }

    /// Whether a live entry exists, without touching access statistics
    pub async fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let state = self.state.lock().await;
        let now = Instant::now();
        state.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    /// Age of a live entry since it was last written
    pub async fn entry_age<Q>(&self, key: &Q) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| now.duration_since(e.created_at))
    }

    /// Drop every entry; hit/miss counters are kept
    pub async fn clear(&self) {
        self.state.lock().await.entries.clear();
    }

    /// Remove all expired entries now; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        self.state.lock().await.purge_expired()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Change the TTL for future writes; existing entries keep their expiry
    pub async fn set_default_ttl(&self, ttl: Duration) {
        self.state.lock().await.config.default_ttl = ttl;
    }

    /// Change the capacity, evicting by policy down to the new limit.
    /// Returns the number of entries evicted.
    pub async fn set_max_size(&self, max_size: usize) -> usize {
        let mut state = self.state.lock().await;
        state.config.max_size = max_size;
        let evicted = state.evict_to(max_size, &self.name);
        if evicted > 0 {
            debug!(cache = %self.name, max_size, evicted, "shrunk cache");
        }
        evicted
    }

    pub async fn config(&self) -> CacheConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let requests = state.hits + state.misses;
        let size = state.entries.len();

        CacheStats {
            name: self.name.to_string(),
            size,
            max_size: state.config.max_size,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            hit_rate: if requests == 0 {
                0.0
            } else {
                state.hits as f64 / requests as f64
            },
            utilization: if state.config.max_size == 0 {
                0.0
            } else {
                size as f64 / state.config.max_size as f64
            },
            eviction_policy: state.config.eviction_policy,
            default_ttl_secs: state.config.default_ttl.as_secs_f64(),
            memory_bytes: state.entries.values().map(|e| e.size_bytes).sum(),
        }
    }
}
