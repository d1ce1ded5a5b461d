//! Cancellable periodic background tasks
//!
//! Each primitive that needs housekeeping (pool health checks, cache expiry sweeps,
//! batch timeout scans) owns one [`PeriodicTask`]. The task ticks on a fixed interval,
//! logs and swallows failures from a pass (including panics), and stops when
//! [`PeriodicTask::stop`] is awaited or the handle is dropped.

use crate::error::ResilienceError;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Shortest period a task will tick at; zero would spin
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a running periodic task
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period` on the current tokio runtime.
    ///
    /// The first pass runs one full period after spawning. A pass that returns an error
    /// or panics is logged and the schedule continues. A zero period is raised to 1ms.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ResilienceError>> + Send + 'static,
    {
        let name = name.into();
        let period = if period.is_zero() {
            warn!(task = %name, "zero period requested, using {:?}", MIN_PERIOD);
            MIN_PERIOD
        } else {
            period
        };
        let task_name = name.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(task = %task_name, period_ms = period.as_millis() as u64, "periodic task started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match AssertUnwindSafe(tick()).catch_unwind().await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!(task = %task_name, error = %e, "periodic pass failed");
                            }
                            Err(_) => {
                                error!(task = %task_name, "periodic pass panicked");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!(task = %task_name, "periodic task stopping");
                        break;
                    }
                }
            }
        });

        Self {
            name,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Name used in log records
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the background loop is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// A pass already in progress is allowed to finish first.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(task = %self.name, error = %e, "periodic task did not shut down cleanly");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
