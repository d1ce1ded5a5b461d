/*!
 * Bulwark - adaptive throughput and fault tolerance for slow, flaky downstreams
 *
 * Wraps calls to expensive services (LLM inference, embedding stores) with:
 * - Circuit breakers whose failure threshold adapts to observed failure rates
 * - Bounded connection pools with stale-handle retirement
 * - TTL caches with LRU, LFU or FIFO eviction
 * - Keyed batch processors that flush on size or timeout
 * - A coordinator that owns named instances, reports on them, and re-tunes them
 *   for latency or resource conservation
 *
 * Version: 0.1.0
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod optimizer;
pub mod report;
pub mod strategy;
pub mod workload;

// Re-export commonly used types
pub use config::{LogLevel, LoggingConfig, OptimizerConfig, StrategyLimits};
pub use error::{GuardedCallError, InstanceKind, OptimizerError, Result};
pub use optimizer::{Optimizer, ValueBatchFn, ValueBatchProcessor, ValueCache};
pub use report::{OptimizerReport, OverallMetrics};
pub use strategy::{Adjustment, AdjustmentKind, OptimizationStrategy};

/// The primitives themselves, for callers that want to own instances directly
pub use bulwark_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
