//! Asynchronous write fan-out queue
//!
//! Cache-fill writes to lower layers are best-effort: once L1 holds the
//! value, L2/L3 population must not extend the caller's critical path. The
//! queue is bounded and drops the oldest task on overflow (newer fills carry
//! newer data); workers retry transient failures with exponential backoff up
//! to a bounded attempt count, then count and log the terminal failure
//! without ever propagating it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::entry::CacheEntry;
use crate::layer::CacheLayer;

/// One pending lower-layer write
pub struct WriteTask {
    /// Target layer
    pub layer: Arc<dyn CacheLayer>,
    /// Cache key
    pub key: String,
    /// Entry to write
    pub entry: CacheEntry,
    /// TTL clamped for the target layer
    pub ttl: Duration,
    /// Delivery attempts made so far
    pub attempts: u32,
}

/// Queue statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Tasks currently pending
    pub depth: usize,
    /// Tasks dropped by overflow or forced shutdown
    pub dropped: u64,
    /// Tasks delivered successfully
    pub completed: u64,
    /// Tasks that exhausted their retry budget
    pub failed: u64,
    /// Individual retry attempts
    pub retries: u64,
}

struct QueueInner {
    deque: Mutex<VecDeque<WriteTask>>,
    notify: Notify,
    config: QueueConfig,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    shutdown: CancellationToken,
}

/// Bounded queue plus worker pool executing lower-layer writes
pub struct WriteQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Create the queue; call [`WriteQueue::spawn_workers`] to start draining
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                deque: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                config,
                dropped: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                retries: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a write; drops the oldest pending task on overflow
    pub fn enqueue(&self, task: WriteTask) {
        if self.inner.shutdown.is_cancelled() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        {
            let mut deque = self.inner.deque.lock();
            if deque.len() >= self.inner.config.capacity.max(1) {
                deque.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Write queue full, dropped oldest task");
            }
            deque.push_back(task);
        }
        self.inner.notify.notify_one();
    }

    /// Start the configured number of worker tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_workers(&self) {
        let mut workers = self.workers.lock();
        for _ in 0..self.inner.config.workers.max(1) {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                worker_loop(inner).await;
            }));
        }
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.inner.deque.lock().len(),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers.
    ///
    /// With `drain_on_shutdown` the workers finish every pending task first;
    /// otherwise pending tasks are dropped and counted.
    pub async fn shutdown(&self) {
        if !self.inner.config.drain_on_shutdown {
            let remaining = {
                let mut deque = self.inner.deque.lock();
                let n = deque.len();
                deque.clear();
                n as u64
            };
            if remaining > 0 {
                self.inner.dropped.fetch_add(remaining, Ordering::Relaxed);
                warn!(remaining, "Dropped pending write tasks on forced shutdown");
            }
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let task = inner.deque.lock().pop_front();
        if let Some(task) = task {
            process(&inner, task).await;
            continue;
        }
        if inner.shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            () = inner.notify.notified() => {}
            () = inner.shutdown.cancelled() => {}
        }
    }
}

/// Deliver one task, retrying transient failures with exponential backoff
async fn process(inner: &QueueInner, mut task: WriteTask) {
    let mut backoff = ExponentialBuilder::default()
        .with_min_delay(inner.config.initial_backoff)
        .with_max_delay(inner.config.max_backoff)
        .with_max_times(inner.config.max_attempts.saturating_sub(1))
        .build();

    loop {
        task.attempts += 1;
        match task
            .layer
            .set(&task.key, task.entry.clone(), task.ttl)
            .await
        {
            Ok(()) => {
                inner.completed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if e.is_retryable() => match backoff.next() {
                Some(delay) => {
                    inner.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        layer = task.layer.name(),
                        key = %task.key,
                        attempt = task.attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying lower-layer write after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        layer = task.layer.name(),
                        key = %task.key,
                        attempts = task.attempts,
                        error = %e,
                        "Lower-layer write failed terminally"
                    );
                    return;
                }
            },
            Err(e) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    layer = task.layer.name(),
                    key = %task.key,
                    error = %e,
                    "Lower-layer write failed (not retryable)"
                );
                return;
            }
        }
    }
}
