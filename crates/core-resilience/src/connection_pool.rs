//! Bounded pool of logical connection handles
//!
//! Handles are opaque: the pool does not know what a connection is, only how many
//! exist, who holds them and how long they have sat idle. Acquisition never waits for
//! capacity; when `max_connections` handles are out the caller gets
//! [`ResilienceError::PoolExhausted`] immediately and decides whether to retry or degrade.
//!
//! A background health check retires handles that sat idle for more than twice the
//! connection timeout, without ever dropping below `min_connections`.

use super::error::ResilienceError;
use super::periodic::PeriodicTask;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Rolling sample size for wait-time and lifetime averages
const SAMPLE_WINDOW: usize = 100;

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of handles outstanding at once
    pub max_connections: usize,
    /// Handles created eagerly and never retired below
    pub min_connections: usize,
    /// Idle handles older than twice this value are considered stale
    pub connection_timeout: Duration,
    /// Period of the background health check
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            connection_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_connections == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ResilienceError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Idle duration after which an available handle may be retired
    pub fn stale_after(&self) -> Duration {
        self.connection_timeout * 2
    }
}

/// A connection handle checked out of a pool
///
/// Handles are not clonable, so a handle can only be held by one caller and must be
/// moved back into [`ConnectionPool::release`].
#[derive(Debug)]
pub struct Connection {
    id: String,
    created_at: Instant,
    usage_count: u64,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of times this handle has been acquired, including the current checkout
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }
}

/// A handle sitting in the available set
#[derive(Debug)]
struct IdleConnection {
    id: String,
    created_at: Instant,
    usage_count: u64,
    idle_since: Instant,
}

/// Bookkeeping for a handle held by a caller
#[derive(Debug)]
struct ActiveConnection {
    created_at: Instant,
    acquired_at: Instant,
}

/// Internal pool state, guarded by a single mutex
#[derive(Debug)]
struct PoolState {
    config: PoolConfig,
    available: VecDeque<IdleConnection>,
    active: HashMap<String, ActiveConnection>,
    total_created: u64,
    total_acquisitions: u64,
    total_releases: u64,
    exhausted_count: u64,
    retired_count: u64,
    wait_times: VecDeque<Duration>,
    lifetimes: VecDeque<Duration>,
}

impl PoolState {
    fn total_count(&self) -> usize {
        self.available.len() + self.active.len()
    }

    fn create(&mut self, pool: &str) -> IdleConnection {
        self.total_created += 1;
        let now = Instant::now();
        let id = format!("{}_conn_{}", pool, self.total_created);
        debug!(pool, connection = %id, "created connection");
        IdleConnection {
            id,
            created_at: now,
            usage_count: 0,
            idle_since: now,
        }
    }

    fn retire_stale(&mut self, pool: &str) -> usize {
        let stale_after = self.config.stale_after();
        let min = self.config.min_connections;
        let mut total = self.total_count();
        let mut retired = 0;

        self.available.retain(|conn| {
            if total > min && conn.idle_since.elapsed() > stale_after {
                total -= 1;
                retired += 1;
                debug!(pool, connection = %conn.id, "retired stale connection");
                false
            } else {
                true
            }
        });

        self.retired_count += retired as u64;
        retired
    }

    fn shrink_to_max(&mut self, pool: &str) -> usize {
        let floor = self.config.max_connections.max(self.config.min_connections);
        let mut retired = 0;
        while self.total_count() > floor {
            match self.available.pop_back() {
                Some(conn) => {
                    debug!(pool, connection = %conn.id, "retired connection above pool maximum");
                    retired += 1;
                }
                None => break,
            }
        }
        self.retired_count += retired as u64;
        retired
    }
}

fn push_sample(samples: &mut VecDeque<Duration>, sample: Duration) {
    if samples.len() == SAMPLE_WINDOW {
        samples.pop_front();
    }
    samples.push_back(sample);
}

fn average(samples: &VecDeque<Duration>) -> Duration {
    if samples.is_empty() {
        Duration::ZERO
    } else {
        samples.iter().sum::<Duration>() / samples.len() as u32
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolStats {
    pub name: String,
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
    pub min_connections: usize,
    /// Releases per acquisition (1.0 when every checkout came back)
    pub efficiency: f64,
    pub total_acquisitions: u64,
    pub total_releases: u64,
    pub exhausted_count: u64,
    pub retired_count: u64,
    pub average_wait_ms: f64,
    /// Average time a handle was held per checkout
    pub average_connection_lifetime_secs: f64,
    pub total_connections_created: u64,
    /// Share of the maximum currently checked out (0.0 - 1.0)
    pub utilization: f64,
}

/// A bounded pool of logical connection handles
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{ConnectionPool, PoolConfig, ResilienceError};
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new("inference", PoolConfig::default());
/// pool.start_health_check().await;
///
/// let conn = pool.acquire().await?;
/// // Use conn.id() to route work...
/// pool.release(conn).await?;
///
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConnectionPool {
    name: Arc<str>,
    state: Arc<Mutex<PoolState>>,
    health_task: Mutex<Option<PeriodicTask>>,
}

impl ConnectionPool {
    /// Create a pool and eagerly open `min_connections` handles.
    ///
    /// The background health check is not started; see [`Self::start_health_check`].
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let mut state = PoolState {
            available: VecDeque::with_capacity(config.max_connections),
            active: HashMap::with_capacity(config.max_connections),
            total_created: 0,
            total_acquisitions: 0,
            total_releases: 0,
            exhausted_count: 0,
            retired_count: 0,
            wait_times: VecDeque::with_capacity(SAMPLE_WINDOW),
            lifetimes: VecDeque::with_capacity(SAMPLE_WINDOW),
            config,
        };

        for _ in 0..state.config.min_connections {
            let conn = state.create(&name);
            state.available.push_back(conn);
        }

        info!(
            pool = %name,
            min = state.config.min_connections,
            max = state.config.max_connections,
            "connection pool initialized"
        );

        Self {
            name,
            state: Arc::new(Mutex::new(state)),
            health_task: Mutex::new(None),
        }
    }

    /// Create a connection pool with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, PoolConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the periodic health check; a no-op if it is already running
    pub async fn start_health_check(&self) {
        let mut slot = self.health_task.lock().await;
        if slot.is_some() {
            return;
        }

        let interval = self.state.lock().await.config.health_check_interval;
        let state = self.state.clone();
        let name = self.name.clone();
        let task = PeriodicTask::spawn(
            format!("{}-health-check", self.name),
            interval,
            move || {
                let state = state.clone();
                let name = name.clone();
                async move {
                    let retired = state.lock().await.retire_stale(&name);
                    if retired > 0 {
                        info!(pool = %name, retired, "health check retired stale connections");
                    }
                    Ok(())
                }
            },
        );
        *slot = Some(task);
    }

    /// Stop the background health check
    pub async fn shutdown(&self) {
        let task = self.health_task.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Acquire a handle without waiting for capacity.
    ///
    /// Reuses the longest-idle available handle, creates a new one while under the
    /// maximum, and otherwise reports exhaustion.
    pub async fn acquire(&self) -> Result<Connection, ResilienceError> {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        let max = state.config.max_connections;
        if state.active.len() >= max {
            state.exhausted_count += 1;
            warn!(pool = %self.name, active = state.active.len(), max, "connection pool exhausted");
            return Err(ResilienceError::PoolExhausted {
                pool: self.name.to_string(),
                active: state.active.len(),
                max,
            });
        }

        let idle = match state.available.pop_front() {
            Some(idle) => idle,
            None => state.create(&self.name),
        };

        let now = Instant::now();
        let conn = Connection {
            id: idle.id,
            created_at: idle.created_at,
            usage_count: idle.usage_count + 1,
        };
        state.active.insert(
            conn.id.clone(),
            ActiveConnection {
                created_at: conn.created_at,
                acquired_at: now,
            },
        );
        state.total_acquisitions += 1;
        push_sample(&mut state.wait_times, started.elapsed());

        debug!(pool = %self.name, connection = %conn.id, uses = conn.usage_count, "acquired connection");
        Ok(conn)
    }

    /// Acquire with a caller-imposed bound on how long the attempt may take
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Connection, ResilienceError> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| ResilienceError::Timeout(timeout))?
    }

    /// Return a handle to the available set
    pub async fn release(&self, conn: Connection) -> Result<(), ResilienceError> {
        let mut state = self.state.lock().await;

        let Some(active) = state.active.remove(&conn.id) else {
            warn!(pool = %self.name, connection = %conn.id, "release of unknown connection");
            return Err(ResilienceError::UnknownConnection {
                pool: self.name.to_string(),
                id: conn.id,
            });
        };

        let held = active.acquired_at.elapsed();
        state.total_releases += 1;
        push_sample(&mut state.lifetimes, held);

        state.available.push_back(IdleConnection {
            id: conn.id,
            created_at: active.created_at,
            usage_count: conn.usage_count,
            idle_since: Instant::now(),
        });
        state.shrink_to_max(&self.name);

        debug!(pool = %self.name, held_ms = held.as_millis() as u64, "released connection");
        Ok(())
    }

    /// Run one health-check pass now; returns the number of handles retired
    pub async fn health_check(&self) -> usize {
        self.state.lock().await.retire_stale(&self.name)
    }

    /// Change the maximum, retiring idle handles above it.
    ///
    /// The maximum never drops below `min_connections`. Handles already checked out are
    /// not revoked; acquisitions fail until enough are released. Returns the applied value.
    pub async fn set_max_connections(&self, max: usize) -> usize {
        let mut state = self.state.lock().await;
        let applied = max.max(state.config.min_connections).max(1);
        let previous = state.config.max_connections;
        state.config.max_connections = applied;
        state.shrink_to_max(&self.name);
        if previous != applied {
            info!(pool = %self.name, from = previous, to = applied, "pool maximum changed");
        }
        applied
    }

    /// Current configuration, including tuned values
    pub async fn config(&self) -> PoolConfig {
        self.state.lock().await.config.clone()
    }

    /// Get current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let efficiency = if state.total_acquisitions == 0 {
            0.0
        } else {
            state.total_releases as f64 / state.total_acquisitions as f64
        };

        PoolStats {
            name: self.name.to_string(),
            total_connections: state.total_count(),
            available_connections: state.available.len(),
            active_connections: state.active.len(),
            max_connections: state.config.max_connections,
            min_connections: state.config.min_connections,
            efficiency,
            total_acquisitions: state.total_acquisitions,
            total_releases: state.total_releases,
            exhausted_count: state.exhausted_count,
            retired_count: state.retired_count,
            average_wait_ms: average(&state.wait_times).as_secs_f64() * 1000.0,
            average_connection_lifetime_secs: average(&state.lifetimes).as_secs_f64(),
            total_connections_created: state.total_created,
            utilization: state.active.len() as f64 / state.config.max_connections.max(1) as f64,
        }
    }
}
