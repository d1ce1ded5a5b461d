/*!
 * Integration tests for the coordinator surface
 *
 * Drives breakers, pools, caches and batch processors through `Optimizer` the way an
 * application would: by name, with the registry resolving each instance.
 */

use bulwark::resilience::{
    BatchConfig, BoxError, CacheConfig, CircuitBreakerConfig, CircuitState, EvictionPolicy,
    PoolConfig, ResilienceError,
};
use bulwark::{
    GuardedCallError, OptimizationStrategy, Optimizer, OptimizerConfig, OptimizerError,
    ValueBatchFn,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn strict_breaker(threshold: usize, recovery: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: threshold,
        success_threshold: 2,
        recovery_timeout: recovery,
        adaptive: false,
        ..Default::default()
    }
}

/// Batch function that records every batch it receives and echoes the payloads back
fn recording_batch_fn() -> (ValueBatchFn, Arc<Mutex<Vec<Vec<Value>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let function: ValueBatchFn = Arc::new(move |items: Vec<Value>| {
        let recorder = recorder.clone();
        async move {
            recorder.lock().unwrap().push(items.clone());
            Ok::<_, BoxError>(items)
        }
    });
    (function, seen)
}

#[tokio::test]
async fn test_breaker_opens_after_consecutive_failures() {
    let optimizer = Optimizer::default();
    optimizer
        .register_breaker("llm", strict_breaker(3, Duration::from_secs(60)))
        .await
        .unwrap();
    let invocations = AtomicUsize::new(0);

    for _ in 0..3 {
        let err = optimizer
            .guarded_call("llm", || async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("upstream timeout")
            })
            .await
            .unwrap_err();
        assert!(!err.is_open());
    }

    let rejected = optimizer
        .guarded_call("llm", || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &str>(())
        })
        .await;

    assert!(rejected.unwrap_err().is_open());
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let report = optimizer.report().await;
    assert_eq!(report.circuit_breakers["llm"].state, CircuitState::Open);
    assert_eq!(report.circuit_breakers["llm"].rejected_calls, 1);
    assert_eq!(report.overall_metrics.active_circuit_breakers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_through_half_open() {
    let optimizer = Optimizer::default();
    let breaker = optimizer
        .register_breaker("llm", strict_breaker(2, Duration::from_secs(30)))
        .await
        .unwrap();

    for _ in 0..2 {
        let _ = optimizer
            .guarded_call("llm", || async { Err::<(), _>("down") })
            .await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    tokio::time::advance(Duration::from_secs(10)).await;
    let early = optimizer
        .guarded_call("llm", || async { Ok::<_, &str>(1) })
        .await;
    assert!(early.unwrap_err().is_open());

    tokio::time::advance(Duration::from_secs(21)).await;
    let probe = optimizer
        .guarded_call("llm", || async { Ok::<_, &str>(1) })
        .await;
    assert_eq!(probe.unwrap(), 1);
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    optimizer
        .guarded_call("llm", || async { Ok::<_, &str>(2) })
        .await
        .unwrap();
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_pool_exhaustion_through_registry() {
    let optimizer = Optimizer::default();
    optimizer
        .register_pool(
            "inference",
            PoolConfig {
                max_connections: 2,
                min_connections: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let timeout = Duration::from_millis(50);
    let first = optimizer.acquire_connection("inference", timeout).await.unwrap();
    let second = optimizer.acquire_connection("inference", timeout).await.unwrap();
    assert_ne!(first.id(), second.id());

    let third = optimizer.acquire_connection("inference", timeout).await;
    match third {
        Err(OptimizerError::Resilience(ResilienceError::PoolExhausted { active, max, .. })) => {
            assert_eq!(active, 2);
            assert_eq!(max, 2);
        }
        other => panic!("expected pool exhaustion, got {:?}", other),
    }

    optimizer.release_connection("inference", first).await.unwrap();
    let again = optimizer.acquire_connection("inference", timeout).await.unwrap();

    let stats = optimizer.report().await.connection_pools["inference"].clone();
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.exhausted_count, 1);

    optimizer.release_connection("inference", second).await.unwrap();
    optimizer.release_connection("inference", again).await.unwrap();
    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_lru_cache_through_registry() {
    let optimizer = Optimizer::default();
    optimizer
        .register_cache(
            "results",
            CacheConfig {
                max_size: 2,
                eviction_policy: EvictionPolicy::Lru,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    optimizer.cache_put("results", "a", json!("A"), None).await.unwrap();
    optimizer.cache_put("results", "b", json!("B"), None).await.unwrap();
    assert_eq!(
        optimizer.cache_get("results", "a").await.unwrap(),
        Some(json!("A"))
    );
    optimizer.cache_put("results", "c", json!("C"), None).await.unwrap();

    assert_eq!(optimizer.cache_get("results", "b").await.unwrap(), None);
    assert_eq!(
        optimizer.cache_get("results", "a").await.unwrap(),
        Some(json!("A"))
    );
    assert_eq!(
        optimizer.cache_get("results", "c").await.unwrap(),
        Some(json!("C"))
    );

    let stats = optimizer.report().await.caches["results"].clone();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.evictions, 1);
    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_cache_entry_with_short_ttl_expires() {
    let optimizer = Optimizer::default();
    optimizer
        .register_cache("ctx", CacheConfig::default())
        .await
        .unwrap();

    optimizer
        .cache_put("ctx", "session", json!({"turns": 3}), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert!(optimizer.cache_get("ctx", "session").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(optimizer.cache_get("ctx", "session").await.unwrap().is_none());
    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_batch_flushes_on_size_in_submission_order() {
    let optimizer = Optimizer::default();
    let processor = optimizer
        .register_batch_processor(
            "ops",
            BatchConfig {
                batch_size: 3,
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let (store, seen) = recording_batch_fn();

    let op1 = optimizer
        .submit_batched("ops", "writes", json!("op1"), store.clone())
        .await
        .unwrap();
    let op2 = optimizer
        .submit_batched("ops", "writes", json!("op2"), store.clone())
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(processor.stats().await.pending_operations, 2);

    let op3 = optimizer
        .submit_batched("ops", "writes", json!("op3"), store.clone())
        .await
        .unwrap();

    assert_eq!(op1.await.unwrap(), json!("op1"));
    assert_eq!(op2.await.unwrap(), json!("op2"));
    assert_eq!(op3.await.unwrap(), json!("op3"));

    let batches = seen.lock().unwrap().clone();
    assert_eq!(batches, vec![vec![json!("op1"), json!("op2"), json!("op3")]]);

    let stats = processor.stats().await;
    assert_eq!(stats.total_batches_processed, 1);
    assert_eq!(stats.size_flushes, 1);
    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_runs_pending_batches() {
    let optimizer = Optimizer::default();
    optimizer
        .register_batch_processor(
            "ops",
            BatchConfig {
                batch_size: 10,
                batch_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let (store, seen) = recording_batch_fn();

    let pending = optimizer
        .submit_batched("ops", "writes", json!(42), store)
        .await
        .unwrap();
    optimizer.shutdown().await;

    assert_eq!(pending.await.unwrap(), json!(42));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cached_call_serves_concurrent_readers_after_first_fill() {
    let optimizer = Arc::new(Optimizer::with_config(&OptimizerConfig::default()).await.unwrap());
    let invocations = Arc::new(AtomicUsize::new(0));

    let first: Vec<String> = optimizer
        .cached_call("memory_extraction", "extraction_results", "doc-7", || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(vec!["likes tea".to_string()])
        })
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    let readers = (0..8).map(|_| {
        let optimizer = optimizer.clone();
        let invocations = invocations.clone();
        async move {
            optimizer
                .cached_call("memory_extraction", "extraction_results", "doc-7", || async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok::<Vec<String>, String>(Vec::new())
                })
                .await
        }
    });
    for result in futures::future::join_all(readers).await {
        assert_eq!(result.unwrap(), vec!["likes tea".to_string()]);
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let report = optimizer.report().await;
    assert_eq!(report.caches["extraction_results"].hits, 8);
    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_unknown_names_are_registry_errors() {
    let optimizer = Optimizer::with_config(&OptimizerConfig::default()).await.unwrap();

    let call = optimizer
        .guarded_call("no_such_breaker", || async { Ok::<_, String>(()) })
        .await;
    assert!(matches!(
        call,
        Err(GuardedCallError::Registry(OptimizerError::UnknownInstance { .. }))
    ));

    assert!(optimizer
        .acquire_connection("no_such_pool", Duration::from_millis(10))
        .await
        .is_err());
    assert!(optimizer
        .cache_put("no_such_cache", "k", json!(1), None)
        .await
        .is_err());
    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_latency_strategy_over_default_components() {
    let optimizer = Optimizer::with_config(&OptimizerConfig::default()).await.unwrap();

    let adjustment = optimizer
        .apply_strategy(OptimizationStrategy::Latency)
        .await
        .unwrap();
    // Both cache TTLs, the batch timeout and the pool maximum
    assert_eq!(adjustment.instances_changed, 4);

    let report = optimizer.report().await;
    assert_eq!(report.optimization_strategy, OptimizationStrategy::Latency);
    assert_eq!(report.performance_optimizations_applied, 1);
    assert_eq!(report.caches["extraction_results"].default_ttl_secs, 180.0);
    assert_eq!(report.caches["conversation_context"].default_ttl_secs, 180.0);
    assert_eq!(report.connection_pools["inference"].max_connections, 16);
    assert_eq!(report.batch_processors["memory_operations"].batch_timeout_secs, 1.0);
    optimizer.shutdown().await;
}

#[tokio::test]
async fn test_resource_strategy_over_default_components() {
    let optimizer = Optimizer::with_config(&OptimizerConfig::default()).await.unwrap();

    optimizer
        .apply_strategy(OptimizationStrategy::Resource)
        .await
        .unwrap();

    let report = optimizer.report().await;
    assert_eq!(report.caches["extraction_results"].max_size, 250);
    assert_eq!(report.caches["conversation_context"].max_size, 100);
    assert_eq!(report.connection_pools["inference"].max_connections, 4);
    assert_eq!(report.batch_processors["memory_operations"].batch_size, 7);

    let json: Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["optimization_strategy"], "resource");
    assert_eq!(json["overall_metrics"]["total_caches"], 2);
    assert_eq!(json["overall_metrics"]["total_circuit_breakers"], 2);

    let log = optimizer.adjustments().await;
    assert_eq!(log.len(), 1);
    let entry = serde_json::to_value(&log[0]).unwrap();
    assert_eq!(entry["type"], "resource_optimization");
    optimizer.shutdown().await;
}
