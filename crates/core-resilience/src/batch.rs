//! Key-coalescing batch processor
//!
//! Operations submitted under the same batch key accumulate in a pending list. The list
//! is flushed as one batch when it reaches `batch_size`, or by a background scanner once
//! its oldest operation has waited `batch_timeout`. Whichever happens first removes the
//! list under the lock, so a batch is only ever flushed once.
//!
//! A flush hands the operations to a worker task tracked by the processor, so
//! [`BatchProcessor::shutdown`] can wait for every batch in flight. Operations inside one flush are
//! grouped by batch function, and each function is called once with its payloads in
//! submission order. Result `i` resolves operation `i`; a failing function resolves every
//! operation in its group with the same shared error.
//!
//! ```text
//!  submit(key, payload, f) ──► pending[key] ──┬── len == batch_size ──► worker
//!                                             └── age >= batch_timeout ─► worker (scanner)
//!
//!  worker: group by f ─► f(payloads) ─► resolve each BatchHandle exactly once
//! ```

use super::error::{BatchError, BoxError, ResilienceError};
use super::periodic::PeriodicTask;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Rolling sample size for efficiency averages
const EFFICIENCY_WINDOW: usize = 100;

/// A caller-supplied function that processes a whole batch of payloads at once.
///
/// The returned vector is matched to the input by position. Closures of the shape
/// `Fn(Vec<P>) -> impl Future<Output = Result<Vec<R>, BoxError>>` implement this trait.
#[async_trait]
pub trait BatchFunction<P, R>: Send + Sync
where
    P: Send + 'static,
    R: Send + 'static,
{
    async fn call(&self, payloads: Vec<P>) -> Result<Vec<R>, BoxError>;
}

#[async_trait]
impl<P, R, F, Fut> BatchFunction<P, R> for F
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<R>, BoxError>> + Send + 'static,
{
    async fn call(&self, payloads: Vec<P>) -> Result<Vec<R>, BoxError> {
        (self)(payloads).await
    }
}

/// Shared handle to a batch function
pub type SharedBatchFn<P, R> = Arc<dyn BatchFunction<P, R>>;

/// Batch processor configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Pending operations per key that trigger an immediate flush
    pub batch_size: usize,
    /// Maximum wait of the oldest pending operation before a flush
    pub batch_timeout: Duration,
    /// Period of the timeout scanner
    pub scan_interval: Duration,
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.batch_size == 0 {
            return Err(ResilienceError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.scan_interval.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "scan_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_timeout: Duration::from_secs(2),
            scan_interval: Duration::from_millis(500),
        }
    }
}

/// What caused a batch to be flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Timeout,
    /// `flush_all` or shutdown
    Manual,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlushReason::Size => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Manual => "manual",
        })
    }
}

/// Result handle for one submitted operation.
///
/// Resolves exactly once. Dropping the handle does not cancel the operation; the batch
/// still runs and the result is discarded.
#[derive(Debug)]
pub struct BatchHandle<R> {
    id: u64,
    rx: oneshot::Receiver<Result<R, BatchError>>,
}

impl<R> BatchHandle<R> {
    /// Identifier assigned at submission
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<R> Future for BatchHandle<R> {
    type Output = Result<R, BatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(BatchError::Dropped)))
    }
}

type ResultSink<R> = oneshot::Sender<Result<R, BatchError>>;

struct Operation<P, R> {
    id: u64,
    payload: P,
    function: SharedBatchFn<P, R>,
    sink: ResultSink<R>,
}

struct PendingBatch<P, R> {
    created_at: Instant,
    ops: Vec<Operation<P, R>>,
}

struct BatchState<P, R> {
    config: BatchConfig,
    pending: HashMap<String, PendingBatch<P, R>>,
    next_id: u64,
    batches_processed: u64,
    operations_batched: u64,
    size_flushes: u64,
    timeout_flushes: u64,
    manual_flushes: u64,
    failed_batches: u64,
    efficiency_scores: VecDeque<f64>,
    /// Set by shutdown; later submissions are rejected
    closed: bool,
    workers: JoinSet<()>,
}

impl<P, R> BatchState<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn take_expired(&mut self) -> Vec<(String, PendingBatch<P, R>)> {
        let timeout = self.config.batch_timeout;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, batch)| batch.created_at.elapsed() >= timeout)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|batch| (key, batch)))
            .collect()
    }

    fn take_full(&mut self) -> Vec<(String, PendingBatch<P, R>)> {
        let size = self.config.batch_size;
        let full: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, batch)| batch.ops.len() >= size)
            .map(|(key, _)| key.clone())
            .collect();

        full.into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|batch| (key, batch)))
            .collect()
    }

    /// Hand a removed batch to a tracked worker task, reaping workers that already finished
    fn dispatch(
        &mut self,
        shared: &Arc<Mutex<BatchState<P, R>>>,
        name: &Arc<str>,
        key: String,
        batch: PendingBatch<P, R>,
        reason: FlushReason,
    ) {
        while let Some(joined) = self.workers.try_join_next() {
            if let Err(e) = joined {
                error!(processor = %name, error = %e, "batch worker failed");
            }
        }

        debug!(
            processor = %name,
            key = %key,
            size = batch.ops.len(),
            reason = %reason,
            waited_ms = batch.created_at.elapsed().as_millis() as u64,
            "flushing batch"
        );
        self.workers.spawn(execute_batch(
            shared.clone(),
            name.clone(),
            key,
            batch.ops,
            reason,
        ));
    }

    fn record_flush(&mut self, reason: FlushReason) {
        match reason {
            FlushReason::Size => self.size_flushes += 1,
            FlushReason::Timeout => self.timeout_flushes += 1,
            FlushReason::Manual => self.manual_flushes += 1,
        }
    }
}

/// Batch processor statistics
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BatchStats {
    pub name: String,
    pub total_batches_processed: u64,
    pub total_operations_batched: u64,
    pub pending_operations: usize,
    pub active_batch_groups: usize,
    pub size_flushes: u64,
    pub timeout_flushes: u64,
    pub manual_flushes: u64,
    pub failed_batches: u64,
    /// Operations per second of batch processing time, averaged over recent batches
    pub average_efficiency: f64,
    pub average_batch_size: f64,
    pub batch_size: usize,
    pub batch_timeout_secs: f64,
}

/// Groups submitted operations by key and executes them in batches
pub struct BatchProcessor<P, R> {
    name: Arc<str>,
    state: Arc<Mutex<BatchState<P, R>>>,
    scanner: Mutex<Option<PeriodicTask>>,
}

impl<P, R> fmt::Debug for BatchProcessor<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<P, R> BatchProcessor<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Create a processor. The timeout scanner is not started; see [`Self::start_scanner`].
    pub fn new(name: impl Into<String>, config: BatchConfig) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        debug!(
            processor = %name,
            batch_size = config.batch_size,
            timeout_ms = config.batch_timeout.as_millis() as u64,
            "batch processor initialized"
        );
        Self {
            name,
            state: Arc::new(Mutex::new(BatchState {
                config: BatchConfig {
                    batch_size: config.batch_size.max(1),
                    ..config
                },
                pending: HashMap::new(),
                next_id: 0,
                batches_processed: 0,
                operations_batched: 0,
                size_flushes: 0,
                timeout_flushes: 0,
                manual_flushes: 0,
                failed_batches: 0,
                efficiency_scores: VecDeque::with_capacity(EFFICIENCY_WINDOW),
                closed: false,
                workers: JoinSet::new(),
            })),
            scanner: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the timeout scanner; a no-op if it is already running
    pub async fn start_scanner(&self) {
        let mut slot = self.scanner.lock().await;
        if slot.is_some() {
            return;
        }

        let interval = self.state.lock().await.config.scan_interval;
        let state = self.state.clone();
        let name = self.name.clone();
        *slot = Some(PeriodicTask::spawn(
            format!("{}-timeout-scanner", self.name),
            interval,
            move || {
                let state = state.clone();
                let name = name.clone();
                async move {
                    let mut guard = state.lock().await;
                    for (key, batch) in guard.take_expired() {
                        guard.dispatch(&state, &name, key, batch, FlushReason::Timeout);
                    }
                    Ok(())
                }
            },
        ));
    }

    /// Queue one operation under `key`; returns a handle that resolves to its result.
    ///
    /// After [`Self::shutdown`] the handle resolves immediately to [`BatchError::Closed`].
    pub async fn submit(
        &self,
        key: impl Into<String>,
        payload: P,
        function: SharedBatchFn<P, R>,
    ) -> BatchHandle<R> {
        let key = key.into();
        let (sink, rx) = oneshot::channel();

        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;

        if state.closed {
            drop(state);
            warn!(processor = %self.name, key = %key, "submission after shutdown rejected");
            // The receiver is still held below, so the send cannot fail
            let _ = sink.send(Err(BatchError::Closed {
                processor: self.name.to_string(),
            }));
            return BatchHandle { id, rx };
        }

        let batch_size = state.config.batch_size;

        let batch = state
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingBatch {
                created_at: Instant::now(),
                ops: Vec::with_capacity(batch_size),
            });
        batch.ops.push(Operation {
            id,
            payload,
            function,
            sink,
        });

        if batch.ops.len() >= batch_size {
            if let Some(full) = state.pending.remove(&key) {
                state.dispatch(&self.state, &self.name, key, full, FlushReason::Size);
            }
        }

        BatchHandle { id, rx }
    }

    /// Flush every pending batch now, regardless of size or age.
    ///
    /// Returns once the batches are dispatched; await the handles for results.
    pub async fn flush_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let batches: Vec<_> = state.pending.drain().collect();
        let flushed = batches.len();
        for (key, batch) in batches {
            state.dispatch(&self.state, &self.name, key, batch, FlushReason::Manual);
        }
        flushed
    }

    /// Reject further submissions, stop the scanner, and run every pending and in-flight
    /// batch to completion
    pub async fn shutdown(&self) {
        self.state.lock().await.closed = true;

        let task = self.scanner.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }

        self.flush_all().await;

        // Workers take the state lock when they finish, so join them without holding it
        let mut workers = std::mem::take(&mut self.state.lock().await.workers);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(processor = %self.name, error = %e, "batch worker failed during shutdown");
            }
        }
        debug!(processor = %self.name, "batch processor stopped");
    }

    /// Whether [`Self::shutdown`] has been called
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Change the flush size; batches already at the new size are flushed immediately
    pub async fn set_batch_size(&self, batch_size: usize) -> usize {
        let applied = batch_size.max(1);
        let mut state = self.state.lock().await;
        state.config.batch_size = applied;
        for (key, batch) in state.take_full() {
            state.dispatch(&self.state, &self.name, key, batch, FlushReason::Size);
        }
        applied
    }

    /// Change the flush timeout; takes effect on the scanner's next pass
    pub async fn set_batch_timeout(&self, batch_timeout: Duration) {
        self.state.lock().await.config.batch_timeout = batch_timeout;
    }

    pub async fn config(&self) -> BatchConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn stats(&self) -> BatchStats {
        let state = self.state.lock().await;
        let average_efficiency = if state.efficiency_scores.is_empty() {
            0.0
        } else {
            state.efficiency_scores.iter().sum::<f64>() / state.efficiency_scores.len() as f64
        };
        let average_batch_size = if state.batches_processed == 0 {
            0.0
        } else {
            state.operations_batched as f64 / state.batches_processed as f64
        };

        BatchStats {
            name: self.name.to_string(),
            total_batches_processed: state.batches_processed,
            total_operations_batched: state.operations_batched,
            pending_operations: state.pending.values().map(|b| b.ops.len()).sum(),
            active_batch_groups: state.pending.len(),
            size_flushes: state.size_flushes,
            timeout_flushes: state.timeout_flushes,
            manual_flushes: state.manual_flushes,
            failed_batches: state.failed_batches,
            average_efficiency,
            average_batch_size,
            batch_size: state.config.batch_size,
            batch_timeout_secs: state.config.batch_timeout.as_secs_f64(),
        }
    }
}

async fn execute_batch<P, R>(
    state: Arc<Mutex<BatchState<P, R>>>,
    name: Arc<str>,
    key: String,
    ops: Vec<Operation<P, R>>,
    reason: FlushReason,
) where
    P: Send + 'static,
    R: Send + 'static,
{
    let started = Instant::now();
    let total = ops.len();

    // Group by function identity, keeping submission order inside each group
    let mut groups: Vec<(SharedBatchFn<P, R>, Vec<P>, Vec<(u64, ResultSink<R>)>)> = Vec::new();
    for op in ops {
        let identity = Arc::as_ptr(&op.function) as *const ();
        match groups
            .iter()
            .position(|(f, _, _)| Arc::as_ptr(f) as *const () == identity)
        {
            Some(i) => {
                let (_, payloads, sinks) = &mut groups[i];
                payloads.push(op.payload);
                sinks.push((op.id, op.sink));
            }
            None => groups.push((op.function, vec![op.payload], vec![(op.id, op.sink)])),
        }
    }

    let mut failed = 0u64;
    for (function, payloads, sinks) in groups {
        let outcome = match AssertUnwindSafe(function.call(payloads)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(BoxError::from("batch function panicked")),
        };

        match outcome {
            Ok(results) => {
                if results.len() > sinks.len() {
                    warn!(
                        processor = %name,
                        key = %key,
                        expected = sinks.len(),
                        returned = results.len(),
                        "batch function returned extra results"
                    );
                }
                let mut results = results.into_iter();
                for (index, (id, sink)) in sinks.into_iter().enumerate() {
                    let result = results.next().ok_or_else(|| BatchError::MissingResult {
                        key: key.clone(),
                        index,
                    });
                    if sink.send(result).is_err() {
                        debug!(processor = %name, operation = id, "result handle abandoned");
                    }
                }
            }
            Err(e) => {
                failed += 1;
                warn!(processor = %name, key = %key, error = %e, "batch function failed");
                let shared = BatchError::failed(key.clone(), e);
                for (id, sink) in sinks {
                    if sink.send(Err(shared.clone())).is_err() {
                        debug!(processor = %name, operation = id, "result handle abandoned");
                    }
                }
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    let efficiency = if elapsed > 0.0 { total as f64 / elapsed } else { 0.0 };

    let mut state = state.lock().await;
    state.batches_processed += 1;
    state.operations_batched += total as u64;
    state.failed_batches += failed;
    state.record_flush(reason);
    if state.efficiency_scores.len() == EFFICIENCY_WINDOW {
        state.efficiency_scores.pop_front();
    }
    state.efficiency_scores.push_back(efficiency);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio_test::{assert_pending, assert_ready};

    type Calls = Arc<StdMutex<Vec<Vec<u32>>>>;

    fn recorder() -> (SharedBatchFn<u32, u32>, Calls) {
        let calls: Calls = Arc::new(StdMutex::new(Vec::new()));
        let seen = calls.clone();
        let function: SharedBatchFn<u32, u32> = Arc::new(move |items: Vec<u32>| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(items.clone());
                Ok::<_, BoxError>(items.into_iter().map(|x| x * 10).collect())
            }
        });
        (function, calls)
    }

    fn config(batch_size: usize, timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            batch_timeout: Duration::from_millis(timeout_ms),
            scan_interval: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_size_flush_in_submission_order() {
        let processor = BatchProcessor::new("ops", config(3, 60_000));
        let (f, calls) = recorder();

        let mut first = tokio_test::task::spawn(processor.submit("k", 1, f.clone()).await);
        let mut second = tokio_test::task::spawn(processor.submit("k", 2, f.clone()).await);
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(processor.stats().await.pending_operations, 2);

        let third = processor.submit("k", 3, f.clone()).await;
        assert_eq!(third.await.unwrap(), 30);
        assert_eq!(assert_ready!(first.poll()).unwrap(), 10);
        assert_eq!(assert_ready!(second.poll()).unwrap(), 20);

        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2, 3]]);
        let stats = processor.stats().await;
        assert_eq!(stats.size_flushes, 1);
        assert_eq!(stats.timeout_flushes, 0);
        assert_eq!(stats.pending_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flush() {
        let processor = BatchProcessor::new("ops", config(5, 2_000));
        processor.start_scanner().await;
        let (f, calls) = recorder();

        let a = processor.submit("k", 1, f.clone()).await;
        let b = processor.submit("k", 2, f.clone()).await;

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(calls.lock().unwrap().is_empty());

        assert_eq!(a.await.unwrap(), 10);
        assert_eq!(b.await.unwrap(), 20);
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2]]);

        let stats = processor.stats().await;
        assert_eq!(stats.timeout_flushes, 1);
        assert_eq!(stats.total_batches_processed, 1);
        processor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_flush_independently() {
        let processor = BatchProcessor::new("ops", config(5, 2_000));
        processor.start_scanner().await;
        let (f, calls) = recorder();

        let early = processor.submit("early", 1, f.clone()).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let mut late = tokio_test::task::spawn(processor.submit("late", 2, f.clone()).await);

        assert_eq!(early.await.unwrap(), 10);
        assert_pending!(late.poll());
        assert_eq!(*calls.lock().unwrap(), vec![vec![1]]);

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_ready!(late.poll()).unwrap();
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_failure_shared_by_all() {
        let processor = BatchProcessor::<u32, u32>::new("ops", config(2, 60_000));
        let failing: SharedBatchFn<u32, u32> =
            Arc::new(|_items: Vec<u32>| async { Err::<Vec<u32>, BoxError>("downstream unavailable".into()) });

        let a = processor.submit("k", 1, failing.clone()).await;
        let b = processor.submit("k", 2, failing.clone()).await;

        for handle in [a, b] {
            let err = handle.await.unwrap_err();
            assert!(matches!(err, BatchError::Failed { .. }));
            assert_eq!(err.cause().unwrap().to_string(), "downstream unavailable");
        }
        assert_eq!(processor.stats().await.failed_batches, 1);
    }

    #[tokio::test]
    async fn test_short_result_vector() {
        let processor = BatchProcessor::<u32, u32>::new("ops", config(2, 60_000));
        let short: SharedBatchFn<u32, u32> =
            Arc::new(|items: Vec<u32>| async move { Ok::<_, BoxError>(vec![items[0]]) });

        let a = processor.submit("k", 7, short.clone()).await;
        let b = processor.submit("k", 8, short.clone()).await;

        assert_eq!(a.await.unwrap(), 7);
        assert!(matches!(
            b.await,
            Err(BatchError::MissingResult { index: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_grouping_by_function() {
        let processor = BatchProcessor::new("ops", config(4, 60_000));
        let (reads, read_calls) = recorder();
        let (writes, write_calls) = recorder();

        let handles = vec![
            processor.submit("k", 1, reads.clone()).await,
            processor.submit("k", 2, writes.clone()).await,
            processor.submit("k", 3, reads.clone()).await,
            processor.submit("k", 4, writes.clone()).await,
        ];
        let results: Vec<u32> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results, vec![10, 20, 30, 40]);
        assert_eq!(*read_calls.lock().unwrap(), vec![vec![1, 3]]);
        assert_eq!(*write_calls.lock().unwrap(), vec![vec![2, 4]]);
    }

    #[tokio::test]
    async fn test_panicking_function_resolves_handles() {
        let processor = BatchProcessor::<u32, u32>::new("ops", config(1, 60_000));
        let panicking: SharedBatchFn<u32, u32> = Arc::new(|_items: Vec<u32>| async {
            if true {
                panic!("boom");
            }
            Ok::<Vec<u32>, BoxError>(Vec::new())
        });

        let handle = processor.submit("k", 1, panicking).await;
        assert!(matches!(handle.await, Err(BatchError::Failed { .. })));
    }

    #[tokio::test]
    async fn test_abandoned_handle_still_executes() {
        let processor = BatchProcessor::new("ops", config(2, 60_000));
        let (f, calls) = recorder();

        drop(processor.submit("k", 1, f.clone()).await);
        let kept = processor.submit("k", 2, f.clone()).await;

        assert_eq!(kept.await.unwrap(), 20);
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let processor = BatchProcessor::new("ops", config(10, 60_000));
        processor.start_scanner().await;
        let (f, calls) = recorder();

        let a = processor.submit("x", 1, f.clone()).await;
        let b = processor.submit("y", 2, f.clone()).await;
        processor.shutdown().await;

        assert_eq!(a.await.unwrap(), 10);
        assert_eq!(b.await.unwrap(), 20);
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(processor.stats().await.manual_flushes, 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_resolves_closed() {
        let processor = BatchProcessor::new("ops", config(5, 60_000));
        processor.start_scanner().await;
        let (f, calls) = recorder();
        processor.shutdown().await;
        assert!(processor.is_closed().await);

        let handle = processor.submit("k", 1, f.clone()).await;
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("handle resolves without a scanner");
        assert!(matches!(result, Err(BatchError::Closed { ref processor }) if processor == "ops"));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(processor.stats().await.pending_operations, 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_batches() {
        let processor = BatchProcessor::<u32, u32>::new("ops", config(1, 60_000));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let slow: SharedBatchFn<u32, u32> = Arc::new(move |items: Vec<u32>| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BoxError>(items)
            }
        });

        // Size flush starts the worker before shutdown is called
        let handle = processor.submit("k", 7, slow).await;
        processor.shutdown().await;

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(processor.stats().await.size_flushes, 1);
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::default().validate().is_ok());
        assert!(config(0, 1_000).validate().is_err());
        assert!(BatchConfig {
            scan_interval: Duration::ZERO,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn test_lowering_batch_size_flushes_full_batches() {
        let processor = BatchProcessor::new("ops", config(5, 60_000));
        let (f, calls) = recorder();

        let a = processor.submit("k", 1, f.clone()).await;
        let b = processor.submit("k", 2, f.clone()).await;
        assert_eq!(processor.set_batch_size(2).await, 2);

        assert_eq!(a.await.unwrap(), 10);
        assert_eq!(b.await.unwrap(), 20);
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2]]);
        assert_eq!(processor.set_batch_size(0).await, 1);
    }
}
