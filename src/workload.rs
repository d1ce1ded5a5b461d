/*!
 * Synthetic workload driver
 *
 * Pushes randomized calls through a breaker, pool, cache and batch processor so the
 * primitives' statistics and tuning can be observed without a real downstream.
 */

use anyhow::{anyhow, Context, Result};
use bulwark_core_resilience::{BatchHandle, BoxError};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GuardedCallError, OptimizerError};
use crate::optimizer::{Optimizer, ValueBatchFn};

/// Which instances the workload drives, and how
#[derive(Debug, Clone)]
pub struct WorkloadOptions {
    pub breaker: String,
    pub pool: String,
    pub cache: String,
    pub batch_processor: String,
    /// Total guarded calls across all workers
    pub calls: usize,
    /// Probability (0.0 - 1.0) that a simulated downstream call fails
    pub failure_rate: f64,
    pub concurrency: usize,
    /// Distinct cache keys drawn from; smaller spaces yield more hits
    pub key_space: usize,
    /// Simulated downstream latency range, in milliseconds
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub acquire_timeout: Duration,
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            breaker: "memory_extraction".to_string(),
            pool: "inference".to_string(),
            cache: "extraction_results".to_string(),
            batch_processor: "memory_operations".to_string(),
            calls: 200,
            failure_rate: 0.1,
            concurrency: 4,
            key_space: 50,
            min_latency_ms: 1,
            max_latency_ms: 10,
            acquire_timeout: Duration::from_millis(100),
        }
    }
}

/// Outcome counts for one workload run
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkloadSummary {
    pub calls: u64,
    pub succeeded: u64,
    pub downstream_failures: u64,
    pub rejected_by_breaker: u64,
    pub pool_exhausted: u64,
    pub batched_writes: u64,
    pub batch_failures: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    succeeded: AtomicU64,
    downstream_failures: AtomicU64,
    rejected_by_breaker: AtomicU64,
    pool_exhausted: AtomicU64,
    batched_writes: AtomicU64,
    batch_failures: AtomicU64,
}

impl Counters {
    fn summary(&self) -> WorkloadSummary {
        WorkloadSummary {
            calls: self.calls.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            downstream_failures: self.downstream_failures.load(Ordering::Relaxed),
            rejected_by_breaker: self.rejected_by_breaker.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            batched_writes: self.batched_writes.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-call randomness, drawn up front so no RNG is held across an await
struct CallPlan {
    key: String,
    fails: bool,
    latency: Duration,
}

fn plan_call(options: &WorkloadOptions) -> CallPlan {
    use rand::Rng;
    let mut rng = rand::rng();
    let low = options.min_latency_ms.min(options.max_latency_ms);
    CallPlan {
        key: format!("item-{}", rng.random_range(0..options.key_space.max(1))),
        fails: rng.random_bool(options.failure_rate.clamp(0.0, 1.0)),
        latency: Duration::from_millis(rng.random_range(low..=options.max_latency_ms.max(low))),
    }
}

/// Batch function standing in for a bulk store: acknowledges every payload
fn store_batch() -> ValueBatchFn {
    Arc::new(|items: Vec<Value>| async move {
        Ok::<_, BoxError>(
            items
                .into_iter()
                .map(|item| json!({ "stored": item }))
                .collect(),
        )
    })
}

/// Drive the workload to completion and report what happened
pub async fn run(optimizer: Arc<Optimizer>, options: WorkloadOptions) -> Result<WorkloadSummary> {
    // Fail fast on misnamed instances rather than counting every call as a failure
    optimizer.breaker(&options.breaker).await.context("workload breaker")?;
    optimizer.pool(&options.pool).await.context("workload pool")?;
    optimizer.cache(&options.cache).await.context("workload cache")?;
    optimizer
        .batch_processor(&options.batch_processor)
        .await
        .context("workload batch processor")?;

    let counters = Arc::new(Counters::default());
    let options = Arc::new(options);
    let workers = options.concurrency.max(1);
    let store = store_batch();

    info!(
        calls = options.calls,
        workers,
        failure_rate = options.failure_rate,
        "starting synthetic workload"
    );

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        // Spread the remainder over the first workers
        let share = options.calls / workers + usize::from(worker < options.calls % workers);
        let optimizer = optimizer.clone();
        let options = options.clone();
        let counters = counters.clone();
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut writes = Vec::new();
            for _ in 0..share {
                if let Some(write) = run_one(&optimizer, &options, &counters, &store).await? {
                    writes.push(write);
                }
            }
            Ok::<_, OptimizerError>(writes)
        }));
    }

    let mut writes = Vec::new();
    for handle in handles {
        writes.extend(handle.await.context("workload worker panicked")??);
    }

    // Don't wait out the batch timeout for the final partial batches
    optimizer
        .batch_processor(&options.batch_processor)
        .await?
        .flush_all()
        .await;
    for write in writes {
        match write.await {
            Ok(_) => counters.batched_writes.fetch_add(1, Ordering::Relaxed),
            Err(_) => counters.batch_failures.fetch_add(1, Ordering::Relaxed),
        };
    }

    let summary = counters.summary();
    info!(
        succeeded = summary.succeeded,
        failed = summary.downstream_failures,
        rejected = summary.rejected_by_breaker,
        exhausted = summary.pool_exhausted,
        "synthetic workload finished"
    );
    Ok(summary)
}

async fn run_one(
    optimizer: &Optimizer,
    options: &WorkloadOptions,
    counters: &Counters,
    store: &ValueBatchFn,
) -> std::result::Result<Option<BatchHandle<Value>>, OptimizerError> {
    counters.calls.fetch_add(1, Ordering::Relaxed);
    let plan = plan_call(options);

    let conn = match optimizer
        .acquire_connection(&options.pool, options.acquire_timeout)
        .await
    {
        Ok(conn) => conn,
        Err(e) if e.is_transient() => {
            counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            tokio::task::yield_now().await;
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let outcome = optimizer
        .cached_call(&options.breaker, &options.cache, &plan.key, || async {
            tokio::time::sleep(plan.latency).await;
            if plan.fails {
                Err(anyhow!("simulated downstream failure for {}", plan.key))
            } else {
                Ok(json!({ "key": plan.key, "conn": conn.id() }))
            }
        })
        .await;

    optimizer.release_connection(&options.pool, conn).await?;

    match outcome {
        Ok(value) => {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
            let write = optimizer
                .submit_batched(&options.batch_processor, "store", value, store.clone())
                .await?;
            Ok(Some(write))
        }
        Err(GuardedCallError::Registry(e)) => Err(e),
        Err(e) if e.is_open() => {
            counters.rejected_by_breaker.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
        Err(e) => {
            debug!(error = %e, "simulated call failed");
            counters.downstream_failures.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }
}
