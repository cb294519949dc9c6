//! Write queue: linearized, retried writes to the local store.
//!
//! [`WriteQueue::enqueue`] never blocks and never fails. One worker task
//! drains the FIFO in order, running each write on the blocking pool. A
//! write that still fails after `max_retries` retries is counted, logged and
//! reported once through the failure hook; draining then continues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use iterlink_core::{EventId, InstanceId, PersistedEvent, Session, SessionId};
use iterlink_settings::WriteQueueSettings;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::Result;

/// A single durable write.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    /// Upsert an event by id.
    PutEvent(PersistedEvent),
    /// Create a session row ahead of its events.
    EnsureSession {
        /// Owning instance.
        instance_id: InstanceId,
        /// The newly allocated session.
        session: Session,
    },
    /// Attach a server task id to a session.
    SetTaskId {
        /// Target session.
        session_id: SessionId,
        /// Server task id.
        task_id: String,
    },
    /// Record a reconciliation pass.
    MarkReconciled {
        /// Reconciled instance.
        instance_id: InstanceId,
        /// Unix ms of the pass.
        at: i64,
        /// Events replayed (0 when no repair ran).
        repair_size: u64,
    },
}

impl WriteOp {
    /// Event id for `PutEvent`, `None` otherwise.
    pub fn event_id(&self) -> Option<&EventId> {
        match self {
            Self::PutEvent(event) => Some(&event.id),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::PutEvent(_) => "put_event",
            Self::EnsureSession { .. } => "ensure_session",
            Self::SetTaskId { .. } => "set_task_id",
            Self::MarkReconciled { .. } => "mark_reconciled",
        }
    }
}

/// Synchronous write target drained by the queue.
pub trait EventWriter: Send + Sync + 'static {
    /// Apply one write. Must be idempotent for `PutEvent`.
    fn apply(&self, op: &WriteOp) -> Result<()>;
}

/// Reported once per write that exhausted its retries.
#[derive(Clone, Debug)]
pub struct WriteFailure {
    /// Last error message.
    pub message: String,
    /// Cumulative failed writes since the queue started.
    pub failed_count: u64,
    /// Event id when the failed write was an event upsert.
    pub event_id: Option<EventId>,
}

type FailureHook = Box<dyn Fn(&WriteFailure) + Send + Sync>;

/// Retry policy.
#[derive(Clone, Debug)]
pub struct WriteQueueConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each retry.
    pub retry_base_delay: Duration,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self::from(&WriteQueueSettings::default())
    }
}

impl From<&WriteQueueSettings> for WriteQueueConfig {
    fn from(settings: &WriteQueueSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
        }
    }
}

/// Queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Writes accepted by `enqueue`.
    pub enqueued: u64,
    /// Writes that succeeded.
    pub written: u64,
    /// Writes that exhausted their retries.
    pub failed: u64,
}

impl WriteStats {
    /// Writes not yet finished.
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.written + self.failed)
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

enum Item {
    Write(WriteOp),
    Flush(oneshot::Sender<()>),
}

/// Handle to the write worker.
pub struct WriteQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Item>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    hook: Arc<RwLock<Option<FailureHook>>>,
}

impl WriteQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start(writer: Arc<dyn EventWriter>, config: WriteQueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let hook: Arc<RwLock<Option<FailureHook>>> = Arc::new(RwLock::new(None));
        let worker = Worker {
            writer,
            config,
            counters: Arc::clone(&counters),
            hook: Arc::clone(&hook),
        };
        let handle = tokio::spawn(worker.run(rx));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            counters,
            hook,
        }
    }

    /// Register the hook called for each write that exhausts its retries.
    /// Replaces any previous hook.
    pub fn set_failure_hook(&self, hook: impl Fn(&WriteFailure) + Send + Sync + 'static) {
        *self.hook.write() = Some(Box::new(hook));
    }

    /// Append a write to the FIFO. Returns immediately.
    pub fn enqueue(&self, op: WriteOp) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            warn!(op = op.kind(), "write queue closed, dropping write");
            return;
        };
        let _ = self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if tx.send(Item::Write(op)).is_err() {
            // Worker gone; count it as failed so pending() settles.
            let _ = self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("write worker exited, dropping write");
        }
    }

    /// Resolve once every write enqueued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let guard = self.tx.lock();
            let Some(tx) = guard.as_ref() else {
                return;
            };
            if tx.send(Item::Flush(done_tx)).is_err() {
                return;
            }
        }
        let _ = done_rx.await;
    }

    /// Current counters.
    pub fn stats(&self) -> WriteStats {
        WriteStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting writes, drain what is queued and join the worker.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "write worker panicked");
            }
        }
    }
}

struct Worker {
    writer: Arc<dyn EventWriter>,
    config: WriteQueueConfig,
    counters: Arc<Counters>,
    hook: Arc<RwLock<Option<FailureHook>>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Item>) {
        while let Some(item) = rx.recv().await {
            match item {
                Item::Flush(done) => {
                    let _ = done.send(());
                }
                Item::Write(op) => self.write(op).await,
            }
        }
        debug!("write queue drained");
    }

    async fn write(&self, op: WriteOp) {
        let op = Arc::new(op);
        let mut retry = 0u32;
        loop {
            let message = match self.attempt(&op).await {
                Ok(()) => {
                    let _ = self.counters.written.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(message) => message,
            };

            if retry >= self.config.max_retries {
                self.give_up(&op, message);
                return;
            }

            let delay = self.config.retry_base_delay * 2u32.saturating_pow(retry);
            warn!(
                op = op.kind(),
                event_id = ?op.event_id(),
                retry = retry + 1,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "write failed, retrying"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    async fn attempt(&self, op: &Arc<WriteOp>) -> std::result::Result<(), String> {
        let writer = Arc::clone(&self.writer);
        let op = Arc::clone(op);
        match tokio::task::spawn_blocking(move || writer.apply(&op)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("write task failed: {e}")),
        }
    }

    fn give_up(&self, op: &WriteOp, message: String) {
        let failed_count = self.counters.failed.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("iterlink_writes_failed_total", "op" => op.kind()).increment(1);
        error!(
            op = op.kind(),
            event_id = ?op.event_id(),
            failed_count,
            error = %message,
            "write failed after retries"
        );
        let failure = WriteFailure {
            message,
            failed_count,
            event_id: op.event_id().cloned(),
        };
        if let Some(hook) = self.hook.read().as_ref() {
            hook(&failure);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
