/*!
 * Aggregated statistics snapshot
 *
 * Plain data only: the report owns copies of every number, so it can be serialized,
 * logged or shipped elsewhere without holding any primitive's lock.
 */

use bulwark_core_resilience::{BatchStats, BreakerStats, CacheStats, CircuitState, PoolStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::strategy::OptimizationStrategy;

/// Cross-instance figures
#[derive(Debug, Clone, Serialize)]
pub struct OverallMetrics {
    /// Hits over lookups, summed across every cache
    pub cache_hit_rate: f64,
    /// Breakers not currently CLOSED
    pub active_circuit_breakers: usize,
    pub total_circuit_breakers: usize,
    pub total_connection_pools: usize,
    pub total_caches: usize,
    pub total_batch_processors: usize,
}

/// Snapshot of every registered instance
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerReport {
    pub generated_at: DateTime<Utc>,
    pub optimization_strategy: OptimizationStrategy,
    pub overall_metrics: OverallMetrics,
    pub circuit_breakers: BTreeMap<String, BreakerStats>,
    pub connection_pools: BTreeMap<String, PoolStats>,
    pub caches: BTreeMap<String, CacheStats>,
    pub batch_processors: BTreeMap<String, BatchStats>,
    pub performance_optimizations_applied: usize,
}

impl OptimizerReport {
    pub fn new(
        strategy: OptimizationStrategy,
        circuit_breakers: BTreeMap<String, BreakerStats>,
        connection_pools: BTreeMap<String, PoolStats>,
        caches: BTreeMap<String, CacheStats>,
        batch_processors: BTreeMap<String, BatchStats>,
        adjustments_applied: usize,
    ) -> Self {
        let overall_metrics = OverallMetrics {
            cache_hit_rate: overall_hit_rate(caches.values()),
            active_circuit_breakers: circuit_breakers
                .values()
                .filter(|b| b.state != CircuitState::Closed)
                .count(),
            total_circuit_breakers: circuit_breakers.len(),
            total_connection_pools: connection_pools.len(),
            total_caches: caches.len(),
            total_batch_processors: batch_processors.len(),
        };

        Self {
            generated_at: Utc::now(),
            optimization_strategy: strategy,
            overall_metrics,
            circuit_breakers,
            connection_pools,
            caches,
            batch_processors,
            performance_optimizations_applied: adjustments_applied,
        }
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Pooled hit rate: total hits over total lookups, not an average of per-cache rates
fn overall_hit_rate<'a>(caches: impl Iterator<Item = &'a CacheStats>) -> f64 {
    let (hits, lookups) = caches.fold((0u64, 0u64), |(hits, lookups), c| {
        (hits + c.hits, lookups + c.hits + c.misses)
    });
    if lookups == 0 {
        0.0
    } else {
        hits as f64 / lookups as f64
    }
}
