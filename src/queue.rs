//! Priority Wait Queue
//!
//! Holds requests that could not be admitted immediately and retries them
//! in the background. Entries drain strictly by priority, FIFO within a
//! priority, and only the head is ever retried: a blocked head blocks
//! everything behind it until capacity frees or the head's deadline fires.
//! Admitted-but-unreleased requests each occupy one of the configured
//! concurrency slots; callers hand slots back with `release()`.
//!
//! Every entry carries its own deadline timer. Whichever path removes an
//! entry from the queue (admission, timeout, cancellation, shutdown) owns
//! its completion channel, so a waiter is resolved exactly once. Deadlines
//! are hard: the head is re-checked with the queue lock released, so a
//! timer that fires mid-check still removes its entry, and a verdict that
//! lands on a vanished entry hands the consumed tokens back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AdmissionConfig;
use crate::controller::AdmissionController;
use crate::error::AdmissionError;
use crate::metrics;

/// Scheduling priority of a queued request
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Label value used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A waiter's handle on its queued request
#[derive(Debug)]
pub struct PendingAdmission {
    id: Uuid,
    rx: oneshot::Receiver<Result<(), AdmissionError>>,
}

impl PendingAdmission {
    /// Identifier usable with [`WaitQueue::cancel`]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait until the request is admitted, times out, or the queue closes.
    ///
    /// # Errors
    ///
    /// `QueueTimeout` when the deadline fired first, `QueueClosed` when the
    /// queue shut down or the entry was cancelled.
    pub async fn wait(self) -> Result<(), AdmissionError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::QueueClosed),
        }
    }
}

struct Entry {
    id: Uuid,
    user_id: String,
    provider: String,
    model_id: String,
    priority: Priority,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<(), AdmissionError>>,
    timer: Option<JoinHandle<()>>,
}

struct QueueInner {
    controller: Arc<AdmissionController>,
    // Ordered: highest priority first, FIFO within a priority
    entries: Mutex<Vec<Entry>>,
    active: AtomicUsize,
    max_concurrent: usize,
    max_size: usize,
    default_timeout: Duration,
    closed: AtomicBool,
}

/// Priority-ordered wait queue with a background drain loop
pub struct WaitQueue {
    inner: Arc<QueueInner>,
    shutdown_tx: watch::Sender<bool>,
    drain: StdMutex<Option<JoinHandle<()>>>,
}

impl WaitQueue {
    /// Create the queue and start its drain loop.
    pub fn start(controller: Arc<AdmissionController>, config: &AdmissionConfig) -> Self {
        let inner = Arc::new(QueueInner {
            controller,
            entries: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_concurrent: config.global.max_concurrent_requests,
            max_size: config.global.queue_max_size,
            default_timeout: config.queue_timeout(),
            closed: AtomicBool::new(false),
        });

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let drain_interval = config.drain_interval();
        let drain_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(drain_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("Queue drain loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        drain_inner.drain_cycle().await;
                    }
                }
            }
        });

        Self {
            inner,
            shutdown_tx,
            drain: StdMutex::new(Some(handle)),
        }
    }

    /// Queue a request for background admission.
    ///
    /// `timeout` defaults to the configured queue deadline. The returned
    /// handle resolves when the drain loop admits the request.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the queue is at its size limit, `QueueClosed` after
    /// shutdown.
    pub async fn enqueue(
        &self,
        user_id: &str,
        provider: &str,
        model_id: &str,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<PendingAdmission, AdmissionError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::QueueClosed);
        }
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let mut entries = self.inner.entries.lock().await;
        // Re-checked under the lock: shutdown sets the flag before draining
        // waiters under this same lock, so no entry can land in a closed
        // queue
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::QueueClosed);
        }
        if entries.len() >= self.inner.max_size {
            return Err(AdmissionError::QueueFull {
                size: entries.len(),
                limit: self.inner.max_size,
            });
        }

        // After every entry of >= priority keeps FIFO order within a level
        let idx = entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(entries.len());
        entries.insert(
            idx,
            Entry {
                id,
                user_id: user_id.to_string(),
                provider: provider.to_string(),
                model_id: model_id.to_string(),
                priority,
                enqueued_at: Instant::now(),
                tx,
                timer: None,
            },
        );

        let timer_inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer_inner.expire(id).await;
        });
        entries[idx].timer = Some(timer);

        let depth = entries.len();
        metrics::QUEUE_DEPTH.set(depth as i64);
        drop(entries);

        tracing::debug!(
            id = %id,
            user = %user_id,
            priority = %priority,
            depth = depth,
            "Request queued for admission"
        );
        Ok(PendingAdmission { id, rx })
    }

    /// Return a concurrency slot after an admitted request finishes.
    pub fn release(&self) {
        let updated = self
            .inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match updated {
            Ok(prev) => metrics::ACTIVE_REQUESTS.set((prev - 1) as i64),
            Err(_) => tracing::warn!("release() called with no active requests"),
        }
    }

    /// Remove a waiting entry. Returns false if it was already gone
    /// (admitted, timed out, or never queued). A still-held wait() resolves
    /// with `QueueClosed`.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let Some(idx) = entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = entries.remove(idx);
        metrics::QUEUE_DEPTH.set(entries.len() as i64);
        drop(entries);

        if let Some(timer) = entry.timer {
            timer.abort();
        }
        tracing::debug!(id = %id, "Queued request cancelled");
        true
    }

    /// Number of waiting entries
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Whether any entries are waiting
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Admitted requests that have not been released yet
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Stop the drain loop and fail every waiting entry with `QueueClosed`.
    ///
    /// Idempotent; later enqueues are rejected.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.drain.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut entries = self.inner.entries.lock().await;
        let drained: Vec<Entry> = entries.drain(..).collect();
        metrics::QUEUE_DEPTH.set(0);
        drop(entries);

        let waiting = drained.len();
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(AdmissionError::QueueClosed));
        }
        tracing::info!("Wait queue shut down ({} entries failed)", waiting);
    }
}

impl QueueInner {
    /// One drain pass: admit from the head until a stage refuses, the
    /// concurrency cap is reached, or the queue empties.
    async fn drain_cycle(&self) {
        loop {
            if self.active.load(Ordering::Acquire) >= self.max_concurrent {
                break;
            }

            // Snapshot the head and release the lock before the check, so
            // deadline timers and callers are never stuck behind storage
            // latency
            let (head_id, user_id, provider, model_id, priority) = {
                let entries = self.entries.lock().await;
                let Some(head) = entries.first() else { break };
                (
                    head.id,
                    head.user_id.clone(),
                    head.provider.clone(),
                    head.model_id.clone(),
                    head.priority,
                )
            };

            let checked = self
                .controller
                .check(&user_id, &provider, &model_id, priority)
                .await;

            match checked {
                Ok(decision) if decision.allowed => {
                    let mut entries = self.entries.lock().await;
                    if entries.first().map(|e| e.id) != Some(head_id) {
                        drop(entries);
                        // The deadline fired, the waiter cancelled, or a
                        // higher-priority arrival displaced the head while
                        // the check ran; hand the tokens back and start over
                        self.controller
                            .release_admission(&user_id, &provider, &model_id)
                            .await;
                        tracing::debug!(
                            id = %head_id,
                            user = %user_id,
                            "Admitted head left the queue mid-check; tokens returned"
                        );
                        continue;
                    }
                    let entry = entries.remove(0);
                    metrics::QUEUE_DEPTH.set(entries.len() as i64);
                    drop(entries);

                    if let Some(timer) = entry.timer {
                        timer.abort();
                    }
                    metrics::QUEUE_WAIT_SECONDS.observe(entry.enqueued_at.elapsed().as_secs_f64());

                    let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
                    metrics::ACTIVE_REQUESTS.set(active as i64);
                    tracing::debug!(
                        id = %entry.id,
                        user = %entry.user_id,
                        provider = %entry.provider,
                        "Queued request admitted"
                    );

                    if entry.tx.send(Ok(())).is_err() {
                        // Waiter gave up before admission: the recorded
                        // usage stands but no concurrency slot is held
                        let active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
                        metrics::ACTIVE_REQUESTS.set(active as i64);
                        tracing::debug!(id = %entry.id, "Admitted entry had no waiter");
                    }
                }
                // Head still blocked; everything behind it waits
                Ok(_) => break,
                Err(e) => {
                    tracing::error!("Admission check failed during queue drain: {}", e);
                    break;
                }
            }
        }
    }

    /// Deadline fired: remove the entry if it is still queued and fail its
    /// waiter.
    async fn expire(&self, id: Uuid) {
        let mut entries = self.entries.lock().await;
        let Some(idx) = entries.iter().position(|e| e.id == id) else {
            return;
        };
        let entry = entries.remove(idx);
        metrics::QUEUE_DEPTH.set(entries.len() as i64);
        drop(entries);

        let waited = entry.enqueued_at.elapsed();
        tracing::debug!(
            id = %id,
            user = %entry.user_id,
            waited_ms = waited.as_millis() as u64,
            "Queued request timed out"
        );
        let _ = entry.tx.send(Err(AdmissionError::QueueTimeout { waited }));
    }
}
