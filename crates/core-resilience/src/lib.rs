//! Bulwark Core Resilience: Pure-logic resilience and throughput primitives
//!
//! # Overview
//!
//! This crate provides the building blocks that sit between a caller and an expensive,
//! unreliable downstream operation. It includes:
//!
//! - **Circuit Breaker**: Fails fast while a dependency is unhealthy, with a failure
//!   threshold that adapts to recent reliability
//! - **Connection Pool**: Bounded set of opaque connection handles with eager warm-up and
//!   background retirement of stale handles
//! - **Cache**: TTL store with LRU, LFU or FIFO eviction and a periodic expiry sweep
//! - **Batch Processor**: Coalesces operations sharing a key into batches flushed by size
//!   or timeout
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - What the downstream operation computes
//! - Transports (pooled connections are logical handles only)
//! - Configuration files or coordinators
//!
//! Each primitive guards its state with its own lock and never holds it while caller
//! code (the guarded operation, a batch function) runs. Background housekeeping runs as a
//! [`PeriodicTask`] owned by the primitive and stopped explicitly on shutdown.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Adaptive threshold, half-open trial)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Bounded handles
//! │  (No queuing, stale-handle retirement)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Cache                             │  ← Skip repeated work
//! │  (TTL, LRU / LFU / FIFO eviction)       │
//! └─────────────┬───────────────────────────┘
//!               │ miss
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Batch Processor                   │  ← Coalesce by key
//! │  (Flush on size or timeout)             │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!        Downstream Operation
//! ```
//!
//! # Usage Example
//!
//! ## Basic Circuit Breaker
//!
//! ```no_run
//! use bulwark_core_resilience::{CallError, CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), CallError<std::io::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 3,
//!     recovery_timeout: Duration::from_secs(120),
//!     ..Default::default()
//! };
//!
//! let breaker = CircuitBreaker::new("llm_communication", config);
//!
//! let answer = breaker
//!     .execute(|| async {
//!         // Your potentially failing operation
//!         Ok::<_, std::io::Error>(42)
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Batch Processor
//!
//! ```no_run
//! use bulwark_core_resilience::{BatchConfig, BatchProcessor, BoxError, SharedBatchFn};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), bulwark_core_resilience::BatchError> {
//! let processor = BatchProcessor::new("memory_operations", BatchConfig::default());
//! processor.start_scanner().await;
//!
//! let double: SharedBatchFn<u64, u64> = Arc::new(|items: Vec<u64>| async move {
//!     Ok::<_, BoxError>(items.into_iter().map(|x| x * 2).collect())
//! });
//!
//! let handle = processor.submit("reads", 21, double).await;
//! assert_eq!(handle.await?, 42);
//!
//! processor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod periodic;

// Re-export main types for convenience
pub use batch::{
    BatchConfig, BatchFunction, BatchHandle, BatchProcessor, BatchStats, FlushReason,
    SharedBatchFn,
};
pub use cache::{Cache, CacheConfig, CacheStats, EvictionPolicy, Weigher};
pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState, OutcomeRecord,
};
pub use connection_pool::{Connection, ConnectionPool, PoolConfig, PoolStats};
pub use error::{BatchError, BoxError, CallError, ResilienceError};
pub use periodic::PeriodicTask;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use bulwark_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::batch::{BatchConfig, BatchHandle, BatchProcessor, SharedBatchFn};
    pub use super::cache::{Cache, CacheConfig, EvictionPolicy};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{Connection, ConnectionPool, PoolConfig};
    pub use super::error::{BatchError, BoxError, CallError, ResilienceError};
}
