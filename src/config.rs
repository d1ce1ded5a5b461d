/*!
 * Configuration types for Bulwark
 */

use bulwark_core_resilience::{
    BatchConfig, CacheConfig, CircuitBreakerConfig, EvictionPolicy, PoolConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OptimizerError, Result};
use crate::strategy::OptimizationStrategy;

/// Top-level coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Strategy label the coordinator starts with
    #[serde(default)]
    pub strategy: OptimizationStrategy,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Floors and ceilings the strategies tune toward
    #[serde(default)]
    pub limits: StrategyLimits,

    #[serde(default)]
    pub breakers: Vec<BreakerSettings>,

    #[serde(default)]
    pub pools: Vec<PoolSettings>,

    #[serde(default)]
    pub caches: Vec<CacheSettings>,

    #[serde(default)]
    pub batch_processors: Vec<BatchSettings>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: OptimizationStrategy::default(),
            logging: LoggingConfig::default(),
            limits: StrategyLimits::default(),
            breakers: vec![
                BreakerSettings {
                    failure_threshold: 5,
                    recovery_timeout_secs: 60,
                    ..BreakerSettings::named("memory_extraction")
                },
                BreakerSettings {
                    failure_threshold: 3,
                    recovery_timeout_secs: 120,
                    ..BreakerSettings::named("llm_communication")
                },
            ],
            pools: vec![PoolSettings {
                max_connections: 8,
                min_connections: 2,
                ..PoolSettings::named("inference")
            }],
            caches: vec![
                CacheSettings {
                    max_size: 500,
                    default_ttl_secs: 300,
                    ..CacheSettings::named("extraction_results")
                },
                CacheSettings {
                    max_size: 200,
                    default_ttl_secs: 600,
                    ..CacheSettings::named("conversation_context")
                },
            ],
            batch_processors: vec![BatchSettings {
                batch_size: 5,
                batch_timeout_ms: 2000,
                ..BatchSettings::named("memory_operations")
            }],
        }
    }
}

impl OptimizerConfig {
    /// A configuration with no components; everything is registered at runtime
    pub fn empty() -> Self {
        Self {
            breakers: Vec::new(),
            pools: Vec::new(),
            caches: Vec::new(),
            batch_processors: Vec::new(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: OptimizerConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every section for values the primitives cannot honour
    pub fn validate(&self) -> Result<()> {
        unique_names("breakers", self.breakers.iter().map(|b| b.name.as_str()))?;
        unique_names("pools", self.pools.iter().map(|p| p.name.as_str()))?;
        unique_names("caches", self.caches.iter().map(|c| c.name.as_str()))?;
        unique_names(
            "batch_processors",
            self.batch_processors.iter().map(|b| b.name.as_str()),
        )?;

        for breaker in &self.breakers {
            breaker.validate()?;
        }
        for pool in &self.pools {
            pool.validate()?;
        }
        for cache in &self.caches {
            if cache.max_size == 0 {
                return Err(config_error(&cache.name, "max_size must be at least 1"));
            }
            if cache.default_ttl_secs == 0 {
                return Err(config_error(&cache.name, "default_ttl_secs must be positive"));
            }
        }
        for batch in &self.batch_processors {
            if batch.batch_size == 0 {
                return Err(config_error(&batch.name, "batch_size must be at least 1"));
            }
            if batch.scan_interval_ms == 0 {
                return Err(config_error(&batch.name, "scan_interval_ms must be positive"));
            }
        }
        Ok(())
    }
}

fn config_error(name: &str, reason: &str) -> OptimizerError {
    OptimizerError::Config(format!("'{}': {}", name, reason))
}

fn unique_names<'a>(section: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(OptimizerError::Config(format!("{}: empty name", section)));
        }
        if !seen.insert(name) {
            return Err(OptimizerError::Config(format!(
                "{}: duplicate name '{}'",
                section, name
            )));
        }
    }
    Ok(())
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Bounds the optimization strategies move settings toward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyLimits {
    /// Latency: cache TTLs are lowered to at most this
    #[serde(default = "default_latency_ttl_cap_secs")]
    pub latency_ttl_cap_secs: u64,

    /// Latency: batch timeouts are lowered to at most this
    #[serde(default = "default_latency_batch_timeout_cap_ms")]
    pub latency_batch_timeout_cap_ms: u64,

    /// Latency: pool maximums double up to this ceiling
    #[serde(default = "default_latency_pool_ceiling")]
    pub latency_pool_ceiling: usize,

    /// Resource: cache capacities halve down to this floor
    #[serde(default = "default_resource_cache_floor")]
    pub resource_cache_floor: usize,

    /// Resource: batch sizes grow up to this ceiling
    #[serde(default = "default_resource_batch_ceiling")]
    pub resource_batch_ceiling: usize,

    /// Resource: batch sizes grow by this much per application
    #[serde(default = "default_resource_batch_step")]
    pub resource_batch_step: usize,

    /// Resource: pool maximums halve down to this floor
    #[serde(default = "default_resource_pool_floor")]
    pub resource_pool_floor: usize,
}

impl Default for StrategyLimits {
    fn default() -> Self {
        Self {
            latency_ttl_cap_secs: default_latency_ttl_cap_secs(),
            latency_batch_timeout_cap_ms: default_latency_batch_timeout_cap_ms(),
            latency_pool_ceiling: default_latency_pool_ceiling(),
            resource_cache_floor: default_resource_cache_floor(),
            resource_batch_ceiling: default_resource_batch_ceiling(),
            resource_batch_step: default_resource_batch_step(),
            resource_pool_floor: default_resource_pool_floor(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub name: String,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,

    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub adaptive: bool,

    #[serde(default = "default_threshold_min")]
    pub threshold_min: usize,

    #[serde(default = "default_threshold_max")]
    pub threshold_max: usize,

    #[serde(default = "default_adaptation_window")]
    pub adaptation_window: usize,

    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: f64,

    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: f64,

    #[serde(default = "default_threshold_step")]
    pub threshold_step: usize,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl BreakerSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            adaptive: true,
            threshold_min: default_threshold_min(),
            threshold_max: default_threshold_max(),
            adaptation_window: default_adaptation_window(),
            high_water_mark: default_high_water_mark(),
            low_water_mark: default_low_water_mark(),
            threshold_step: default_threshold_step(),
            history_capacity: default_history_capacity(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(config_error(&self.name, "thresholds must be at least 1"));
        }
        if self.threshold_min > self.threshold_max {
            return Err(config_error(&self.name, "threshold_min exceeds threshold_max"));
        }
        if !(0.0..=1.0).contains(&self.low_water_mark)
            || !(0.0..=1.0).contains(&self.high_water_mark)
            || self.low_water_mark > self.high_water_mark
        {
            return Err(config_error(
                &self.name,
                "water marks must satisfy 0 <= low_water_mark <= high_water_mark <= 1",
            ));
        }
        if self.adaptation_window == 0 || self.adaptation_window > self.history_capacity {
            return Err(config_error(
                &self.name,
                "adaptation_window must be between 1 and history_capacity",
            ));
        }
        Ok(())
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            recovery_timeout: Duration::from_secs(s.recovery_timeout_secs),
            adaptive: s.adaptive,
            threshold_min: s.threshold_min,
            threshold_max: s.threshold_max,
            adaptation_window: s.adaptation_window,
            high_water_mark: s.high_water_mark,
            low_water_mark: s.low_water_mark,
            threshold_step: s.threshold_step,
            history_capacity: s.history_capacity,
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub name: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl PoolSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_secs: default_connection_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }

    fn validate(&self) -> Result<()> {
        PoolConfig::from(self)
            .validate()
            .map_err(|e| config_error(&self.name, &e.to_string()))?;
        if self.health_check_interval_secs == 0 {
            return Err(config_error(
                &self.name,
                "health_check_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(s: &PoolSettings) -> Self {
        PoolConfig {
            max_connections: s.max_connections,
            min_connections: s.min_connections,
            connection_timeout: Duration::from_secs(s.connection_timeout_secs),
            health_check_interval: Duration::from_secs(s.health_check_interval_secs),
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub name: String,

    #[serde(default = "default_cache_size")]
    pub max_size: usize,

    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl CacheSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: default_cache_size(),
            default_ttl_secs: default_ttl_secs(),
            eviction_policy: EvictionPolicy::default(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(s: &CacheSettings) -> Self {
        CacheConfig {
            max_size: s.max_size,
            default_ttl: Duration::from_secs(s.default_ttl_secs),
            eviction_policy: s.eviction_policy,
            // A zero period would make the sweep spin
            cleanup_interval: Duration::from_secs(s.cleanup_interval_secs.max(1)),
        }
    }
}

/// Batch processor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    pub name: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

impl BatchSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

impl From<&BatchSettings> for BatchConfig {
    fn from(s: &BatchSettings) -> Self {
        BatchConfig {
            batch_size: s.batch_size,
            batch_timeout: Duration::from_millis(s.batch_timeout_ms),
            scan_interval: Duration::from_millis(s.scan_interval_ms.max(1)),
        }
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_latency_ttl_cap_secs() -> u64 {
    180
}

fn default_latency_batch_timeout_cap_ms() -> u64 {
    1000
}

fn default_latency_pool_ceiling() -> usize {
    20
}

fn default_resource_cache_floor() -> usize {
    50
}

fn default_resource_batch_ceiling() -> usize {
    10
}

fn default_resource_batch_step() -> usize {
    2
}

fn default_resource_pool_floor() -> usize {
    3
}

fn default_failure_threshold() -> usize {
    5
}

fn default_success_threshold() -> usize {
    3
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_threshold_min() -> usize {
    3
}

fn default_threshold_max() -> usize {
    15
}

fn default_adaptation_window() -> usize {
    20
}

fn default_high_water_mark() -> f64 {
    0.95
}

fn default_low_water_mark() -> f64 {
    0.80
}

fn default_threshold_step() -> usize {
    1
}

fn default_history_capacity() -> usize {
    100
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    2
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_cache_size() -> usize {
    1000
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_timeout_ms() -> u64 {
    2000
}

fn default_scan_interval_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_component_set() {
        let config = OptimizerConfig::default();
        assert_eq!(config.strategy, OptimizationStrategy::Balanced);

        let breakers: Vec<_> = config.breakers.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(breakers, vec!["memory_extraction", "llm_communication"]);
        assert_eq!(config.breakers[1].failure_threshold, 3);
        assert_eq!(config.breakers[1].recovery_timeout_secs, 120);

        assert_eq!(config.pools[0].name, "inference");
        assert_eq!(config.pools[0].max_connections, 8);
        assert_eq!(config.caches[1].default_ttl_secs, 600);
        assert_eq!(config.batch_processors[0].batch_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialization_roundtrip_keeps_components() {
        let config = OptimizerConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: OptimizerConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.caches.len(), 2);
        assert_eq!(parsed.caches[0].eviction_policy, EvictionPolicy::Lru);
        assert_eq!(parsed.limits.latency_pool_ceiling, 20);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let toml = r#"
            strategy = "latency"

            [[caches]]
            name = "lookups"
            eviction_policy = "LFU"

            [[pools]]
            name = "inference"
            max_connections = 4
        "#;
        let config: OptimizerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.strategy, OptimizationStrategy::Latency);
        assert!(config.breakers.is_empty());
        assert_eq!(config.caches[0].max_size, 1000);
        assert_eq!(config.caches[0].eviction_policy, EvictionPolicy::Lfu);
        assert_eq!(config.pools[0].min_connections, 2);
        assert_eq!(config.limits.resource_batch_step, 2);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_validation_rejects_bad_sections() {
        let mut config = OptimizerConfig::empty();
        config.pools.push(PoolSettings {
            min_connections: 5,
            max_connections: 2,
            ..PoolSettings::named("p")
        });
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::empty();
        config.breakers.push(BreakerSettings {
            low_water_mark: 0.99,
            high_water_mark: 0.5,
            ..BreakerSettings::named("b")
        });
        assert!(config.validate().is_err());

        let mut config = OptimizerConfig::empty();
        config.caches.push(CacheSettings::named("dup"));
        config.caches.push(CacheSettings::named("dup"));
        assert!(matches!(config.validate(), Err(OptimizerError::Config(_))));

        let mut config = OptimizerConfig::empty();
        config.caches.push(CacheSettings {
            default_ttl_secs: 0,
            ..CacheSettings::named("ctx")
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_convert_to_core_configs() {
        let breaker = CircuitBreakerConfig::from(&BreakerSettings {
            recovery_timeout_secs: 120,
            ..BreakerSettings::named("llm")
        });
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(120));
        assert_eq!(breaker.threshold_max, 15);

        let batch = BatchConfig::from(&BatchSettings::named("ops"));
        assert_eq!(batch.batch_timeout, Duration::from_secs(2));
        assert_eq!(batch.scan_interval, Duration::from_millis(500));

        let cache = CacheConfig::from(&CacheSettings::named("c"));
        assert_eq!(cache.default_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
    }
}
