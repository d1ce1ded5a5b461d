/*!
 * Optimization strategies and the tuning rules they apply
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::StrategyLimits;
use crate::error::OptimizerError;

/// Named optimization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationStrategy {
    /// Settings as configured; the starting label, never applied as a tuning pass
    #[default]
    Balanced,

    /// Shorter TTLs and batch timeouts, larger pools
    Latency,

    /// Smaller caches and pools, larger batches
    Resource,
}

impl OptimizationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationStrategy::Balanced => "balanced",
            OptimizationStrategy::Latency => "latency",
            OptimizationStrategy::Resource => "resource",
        }
    }

    /// Whether a tuning pass exists for this strategy
    pub fn is_applicable(&self) -> bool {
        !matches!(self, OptimizationStrategy::Balanced)
    }
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizationStrategy {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "balanced" => Ok(OptimizationStrategy::Balanced),
            "latency" => Ok(OptimizationStrategy::Latency),
            "resource" | "resources" => Ok(OptimizationStrategy::Resource),
            other => Err(OptimizerError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Kind of tuning pass recorded in the adjustment log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    LatencyOptimization,
    ResourceOptimization,
}

/// One applied tuning pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjustment {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AdjustmentKind,
    pub description: String,
    /// Number of instances whose settings actually changed
    pub instances_changed: usize,
}

impl Adjustment {
    pub fn new(kind: AdjustmentKind, description: impl Into<String>, instances_changed: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            description: description.into(),
            instances_changed,
        }
    }
}

/// Tuning rules. Each moves a setting toward its bound and never past it; a value
/// already beyond the bound is left alone.
impl StrategyLimits {
    pub fn latency_cache_ttl(&self, ttl: Duration) -> Duration {
        ttl.min(Duration::from_secs(self.latency_ttl_cap_secs))
    }

    pub fn latency_batch_timeout(&self, timeout: Duration) -> Duration {
        timeout.min(Duration::from_millis(self.latency_batch_timeout_cap_ms))
    }

    pub fn latency_pool_max(&self, max: usize) -> usize {
        max.max(max.saturating_mul(2).min(self.latency_pool_ceiling))
    }

    pub fn resource_cache_size(&self, size: usize) -> usize {
        if size > self.resource_cache_floor {
            (size / 2).max(self.resource_cache_floor)
        } else {
            size
        }
    }

    pub fn resource_batch_size(&self, size: usize) -> usize {
        size.max(
            size.saturating_add(self.resource_batch_step)
                .min(self.resource_batch_ceiling),
        )
    }

    pub fn resource_pool_max(&self, max: usize) -> usize {
        if max > self.resource_pool_floor {
            (max / 2).max(self.resource_pool_floor)
        } else {
            max
        }
    }
}
