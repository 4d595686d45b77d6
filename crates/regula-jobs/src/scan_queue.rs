//! Priority scan queue with bounded concurrency and retry backoff.
//!
//! Items wait in three FIFO tiers (high, normal, low). A slot is claimed as
//! soon as one is free, under the same lock that admits the item, and the
//! claimed item is handed to one of `max_concurrent` worker tasks. Claimed
//! and running items together never exceed `max_concurrent`. A failed attempt is
//! re-queued behind a [`DelayedTask`] after `min(base * 2^retry_count, max)`;
//! once retries are exhausted the item is handed to [`ScanWorker::abandon`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use regula_core::defaults;
use regula_core::{Error, InputType, Priority, QueueStatus, Result, ScanQueueItem};

use crate::delay::DelayedTask;
use crate::worker::ScanWorker;

/// Error recorded on a record whose scan was cancelled.
pub const CANCELLED_MESSAGE: &str = "Cancelled";

/// Error recorded on a record the queue dropped while shutting down.
pub const SHUTDOWN_MESSAGE: &str = "Interrupted by shutdown";

/// Configuration for the scan queue.
#[derive(Debug, Clone)]
pub struct ScanQueueConfig {
    /// Worker count; the ceiling on in-flight attempts.
    pub max_concurrent: usize,
    /// Retries granted after the first attempt.
    pub max_retries: u32,
    /// Multiplier for the `2^retry_count` backoff.
    pub backoff_base: Duration,
    /// Ceiling on any single backoff delay.
    pub backoff_max: Duration,
    /// Per-attempt timeout.
    pub job_timeout: Duration,
}

impl Default for ScanQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::SCAN_MAX_CONCURRENT,
            max_retries: defaults::SCAN_MAX_RETRIES,
            backoff_base: Duration::from_secs(defaults::SCAN_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(defaults::SCAN_BACKOFF_MAX_SECS),
            job_timeout: Duration::from_secs(defaults::SCAN_JOB_TIMEOUT_SECS),
        }
    }
}

impl ScanQueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SCAN_MAX_CONCURRENT` | `3` | Max in-flight scans |
    /// | `SCAN_MAX_RETRIES` | `2` | Retries after the first attempt |
    /// | `SCAN_BACKOFF_BASE_SECS` | `1` | Backoff multiplier |
    /// | `SCAN_BACKOFF_MAX_SECS` | `60` | Backoff ceiling |
    /// | `SCAN_JOB_TIMEOUT_SECS` | `300` | Per-attempt timeout |
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
        }

        let d = Self::default();
        Self {
            max_concurrent: var::<usize>("SCAN_MAX_CONCURRENT")
                .unwrap_or(d.max_concurrent)
                .max(1),
            max_retries: var("SCAN_MAX_RETRIES").unwrap_or(d.max_retries),
            backoff_base: var("SCAN_BACKOFF_BASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.backoff_base),
            backoff_max: var("SCAN_BACKOFF_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.backoff_max),
            job_timeout: var::<u64>("SCAN_JOB_TIMEOUT_SECS")
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(d.job_timeout),
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Delay before the attempt that follows `retry_count` failures.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

struct ScheduledRetry {
    item: ScanQueueItem,
    task: DelayedTask,
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<ScanQueueItem>,
    normal: VecDeque<ScanQueueItem>,
    low: VecDeque<ScanQueueItem>,
    /// Claimed or running attempts and their cancellation handles.
    in_flight: HashMap<Uuid, CancellationToken>,
    /// Items holding a slot that no worker has picked up yet.
    claimed: VecDeque<(ScanQueueItem, CancellationToken)>,
    retries: HashMap<Uuid, ScheduledRetry>,
    closed: bool,
}

impl QueueState {
    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<ScanQueueItem> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn pop_next(&mut self) -> Option<ScanQueueItem> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn remove_pending(&mut self, id: Uuid) -> Option<ScanQueueItem> {
        for tier in [&mut self.high, &mut self.normal, &mut self.low] {
            if let Some(pos) = tier.iter().position(|item| item.id == id) {
                return tier.remove(pos);
            }
        }
        None
    }

    fn queue_length(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    /// Move waiting items into free slots. Returns how many were claimed.
    fn claim_slots(&mut self, max_concurrent: usize) -> usize {
        let mut claimed = 0;
        while !self.closed && self.in_flight.len() < max_concurrent {
            let Some(item) = self.pop_next() else {
                break;
            };
            let token = CancellationToken::new();
            self.in_flight.insert(item.id, token.clone());
            self.claimed.push_back((item, token));
            claimed += 1;
        }
        claimed
    }

    /// Empty every tier, claimed slot and retry timer.
    fn drain_waiting(&mut self) -> Vec<ScanQueueItem> {
        let mut dropped: Vec<ScanQueueItem> = std::iter::from_fn(|| self.pop_next()).collect();
        for (item, _) in std::mem::take(&mut self.claimed) {
            self.in_flight.remove(&item.id);
            dropped.push(item);
        }
        for (_, retry) in self.retries.drain() {
            retry.task.cancel();
            dropped.push(retry.item);
        }
        dropped
    }
}

enum AttemptResult {
    Succeeded,
    Failed(String),
    Cancelled,
}

struct Inner {
    config: ScanQueueConfig,
    worker: Arc<dyn ScanWorker>,
    state: Mutex<QueueState>,
    work_available: Notify,
    /// Stops workers and retry timers. In-flight attempts are not children.
    stop: CancellationToken,
}

/// Handle to a running scan queue. Cheap to clone.
#[derive(Clone)]
pub struct ScanQueue {
    inner: Arc<Inner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ScanQueue {
    /// Start the queue with `config.max_concurrent` workers.
    pub fn start(config: ScanQueueConfig, worker: Arc<dyn ScanWorker>) -> Self {
        let worker_count = config.max_concurrent.max(1);
        let inner = Arc::new(Inner {
            config,
            worker,
            state: Mutex::new(QueueState::default()),
            work_available: Notify::new(),
            stop: CancellationToken::new(),
        });

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|index| tokio::spawn(Inner::worker_loop(inner.clone(), index)))
            .collect();

        info!(
            subsystem = "jobs",
            component = "scan_queue",
            max_concurrent = worker_count,
            max_retries = inner.config.max_retries,
            job_timeout_secs = inner.config.job_timeout.as_secs(),
            "Scan queue started"
        );

        Self {
            inner,
            workers: Arc::new(Mutex::new(handles)),
        }
    }

    pub fn config(&self) -> &ScanQueueConfig {
        &self.inner.config
    }

    /// Admit a scan job for a persisted check record.
    ///
    /// Rejects only malformed input or a stopped queue; every later failure is
    /// observable through the record's status.
    pub async fn enqueue(
        &self,
        id: Uuid,
        payload: JsonValue,
        organization_id: Uuid,
        priority: Priority,
        kind: InputType,
    ) -> Result<()> {
        if !payload.is_object() {
            return Err(Error::InvalidInput(
                "scan payload must be a JSON object".to_string(),
            ));
        }
        let item = ScanQueueItem::new(id, payload, organization_id, priority, kind)
            .with_max_retries(self.inner.config.max_retries);
        self.enqueue_item(item).await
    }

    /// Admit a prepared item, keeping its retry budget.
    pub async fn enqueue_item(&self, item: ScanQueueItem) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Job("scan queue is shut down".to_string()));
        }

        debug!(
            subsystem = "jobs",
            component = "scan_queue",
            check_id = %item.id,
            organization_id = %item.organization_id,
            priority = %item.priority,
            "Scan job enqueued"
        );

        let priority = item.priority;
        state.tier_mut(priority).push_back(item);
        let claimed = state.claim_slots(self.inner.config.max_concurrent);
        drop(state);
        self.inner.wake_workers(claimed);
        Ok(())
    }

    /// Current queue metrics.
    pub async fn status(&self) -> QueueStatus {
        let state = self.inner.state.lock().await;
        QueueStatus {
            queue_length: state.queue_length(),
            processing_count: state.in_flight.len(),
            max_concurrent: self.inner.config.max_concurrent,
        }
    }

    /// Items waiting out a backoff delay.
    pub async fn scheduled_retries(&self) -> usize {
        self.inner.state.lock().await.retries.len()
    }

    /// Cancel a scan wherever it is: pending, waiting to retry, or in flight.
    ///
    /// Returns `false` when the queue does not hold the item.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let mut state = self.inner.state.lock().await;

        let removed = if let Some(item) = state.remove_pending(id) {
            Some(item)
        } else if let Some(retry) = state.retries.remove(&id) {
            retry.task.cancel();
            Some(retry.item)
        } else if let Some(token) = state.in_flight.get(&id) {
            // The attempt observes the token and abandons the item itself.
            token.cancel();
            info!(
                subsystem = "jobs",
                component = "scan_queue",
                check_id = %id,
                "Cancelling in-flight scan"
            );
            return true;
        } else {
            None
        };
        drop(state);

        match removed {
            Some(item) => {
                info!(
                    subsystem = "jobs",
                    component = "scan_queue",
                    check_id = %id,
                    "Cancelled queued scan"
                );
                self.inner.worker.abandon(&item, CANCELLED_MESSAGE).await;
                true
            }
            None => false,
        }
    }

    /// Stop accepting work, cancel retry timers and wait for running
    /// attempts to finish. Items that never started are dropped and their
    /// records failed with [`SHUTDOWN_MESSAGE`].
    pub async fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.drain_waiting()
        };
        self.inner.stop.cancel();

        for item in &dropped {
            self.inner.worker.abandon(item, SHUTDOWN_MESSAGE).await;
        }

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(
                    subsystem = "jobs",
                    component = "scan_queue",
                    error = ?e,
                    "Scan worker task panicked"
                );
            }
        }

        info!(
            subsystem = "jobs",
            component = "scan_queue",
            dropped_pending = dropped.len(),
            "Scan queue stopped"
        );
    }
}

impl Inner {
    fn wake_workers(&self, claimed: usize) {
        for _ in 0..claimed {
            self.work_available.notify_one();
        }
    }

    async fn worker_loop(self: Arc<Self>, index: usize) {
        debug!(
            subsystem = "jobs",
            component = "scan_queue",
            worker = index,
            "Scan worker started"
        );

        loop {
            let mut notified = Box::pin(self.work_available.notified());
            // Register before checking so an enqueue between the check and the
            // await is not missed.
            notified.as_mut().enable();

            let next = {
                let mut state = self.state.lock().await;
                if self.stop.is_cancelled() {
                    break;
                }
                state.claim_slots(self.config.max_concurrent);
                state
                    .claimed
                    .pop_front()
                    .map(|next| (next, state.claimed.len()))
            };

            match next {
                Some(((item, token), others)) => {
                    // Deregister before waking so this worker cannot take
                    // the wakeup meant for an idle one.
                    drop(notified);
                    self.wake_workers(others);
                    self.clone().run_attempt(item, token).await;
                }
                None => {
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = &mut notified => {}
                    }
                }
            }
        }

        debug!(
            subsystem = "jobs",
            component = "scan_queue",
            worker = index,
            "Scan worker stopped"
        );
    }

    async fn run_attempt(self: Arc<Self>, mut item: ScanQueueItem, token: CancellationToken) {
        let start = Instant::now();
        let timeout = self.config.job_timeout;

        debug!(
            subsystem = "jobs",
            component = "scan_queue",
            check_id = %item.id,
            retry_count = item.retry_count,
            "Dispatching scan"
        );

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => AttemptResult::Cancelled,
            res = tokio::time::timeout(timeout, self.worker.process(&item)) => match res {
                Ok(Ok(())) => AttemptResult::Succeeded,
                Ok(Err(e)) => AttemptResult::Failed(e.to_string()),
                Err(_) => AttemptResult::Failed(format!(
                    "Scan attempt exceeded timeout of {}s",
                    timeout.as_secs()
                )),
            },
        };

        let mut state = self.state.lock().await;
        state.in_flight.remove(&item.id);
        let claimed = state.claim_slots(self.config.max_concurrent);
        self.wake_workers(claimed);

        match result {
            AttemptResult::Succeeded => {
                drop(state);
                debug!(
                    subsystem = "jobs",
                    component = "scan_queue",
                    check_id = %item.id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Scan job finished"
                );
            }
            AttemptResult::Cancelled => {
                drop(state);
                self.worker.abandon(&item, CANCELLED_MESSAGE).await;
            }
            AttemptResult::Failed(err) => {
                item.retry_count += 1;
                let attempts = item.retry_count;

                if item.has_retries_left() && !state.closed {
                    let delay = self.config.backoff_delay(item.retry_count);
                    let id = item.id;
                    let queue = self.clone();
                    let retry_item = item.clone();
                    let task = DelayedTask::spawn(delay, &self.stop, async move {
                        queue.requeue(retry_item).await;
                    });
                    warn!(
                        subsystem = "jobs",
                        component = "scan_queue",
                        check_id = %id,
                        retry_count = item.retry_count,
                        backoff_ms = task.delay().as_millis() as u64,
                        error = %err,
                        "Scan attempt failed, scheduling retry"
                    );
                    state.retries.insert(id, ScheduledRetry { item, task });
                } else if state.closed {
                    drop(state);
                    warn!(
                        subsystem = "jobs",
                        component = "scan_queue",
                        check_id = %item.id,
                        error = %err,
                        "Scan attempt failed during shutdown, not retrying"
                    );
                    let message = format!("{}: {}", SHUTDOWN_MESSAGE, err);
                    self.worker.abandon(&item, &message).await;
                } else {
                    drop(state);
                    warn!(
                        subsystem = "jobs",
                        component = "scan_queue",
                        check_id = %item.id,
                        retry_count = item.retry_count,
                        error = %err,
                        "Scan retries exhausted, abandoning"
                    );
                    let message = format!("Scan failed after {} attempts: {}", attempts, err);
                    self.worker.abandon(&item, &message).await;
                }
            }
        }
    }

    /// Put a retried item back at the tail of its tier.
    async fn requeue(&self, item: ScanQueueItem) {
        let mut state = self.state.lock().await;
        // A cancel that raced the timer already removed the entry.
        if state.retries.remove(&item.id).is_none() || state.closed {
            return;
        }
        debug!(
            subsystem = "jobs",
            component = "scan_queue",
            check_id = %item.id,
            retry_count = item.retry_count,
            "Re-queueing scan after backoff"
        );
        let priority = item.priority;
        state.tier_mut(priority).push_back(item);
        let claimed = state.claim_slots(self.config.max_concurrent);
        drop(state);
        self.wake_workers(claimed);
    }
}
