//! The output pump (spec §3.5, §4.3): an ordered, bounded, event-driven
//! channel draining `stdout`/`stderr` chunks and flush sentinels from the
//! evaluator thread to the transport.
//!
//! The queue is hand-rolled rather than a plain `tokio::mpsc` channel
//! because the `drop_oldest` backpressure policy needs to evict from the
//! front of the queue from the *producer* side, which a channel's `Sender`
//! cannot do.

use crate::error::{ExecutorError, PumpError};
use crate::sink::OutputSink;
use sies_wire::{Message, MessageBody, StreamKind};
use sies_common::MessageId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

/// How the pump behaves when its bounded queue is full (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    Block,
    DropNew,
    DropOldest,
    Error,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Block
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub chunk_size_bytes: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            backpressure: BackpressurePolicy::Block,
            chunk_size_bytes: 65536,
        }
    }
}

/// What completes a flush sentinel's waker (spec §3.5: "`FlushSentinel`
/// carries a waker whose completion signals... all prior chunks have been
/// delivered").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed,
    TransportClosed,
}

enum OutputItem {
    Chunk { stream: StreamKind, bytes: Vec<u8> },
    Flush(oneshot::Sender<FlushOutcome>),
    Stop,
}

struct Queue {
    items: Mutex<VecDeque<OutputItem>>,
    capacity: usize,
    item_available: Notify,
    space_available: Notify,
    closed: std::sync::atomic::AtomicBool,
}

/// Counters exposed for telemetry (spec §3.3 "a counter set for
/// telemetry").
#[derive(Debug, Default)]
pub struct PumpCounters {
    pub dropped_new: AtomicU64,
    pub dropped_oldest: AtomicU64,
}

/// The producer-facing handle used by the executor and the `input()` shim
/// to push output and request a flush fence.
pub struct PumpHandle {
    queue: Arc<Queue>,
    policy: BackpressurePolicy,
    chunk_size_bytes: usize,
    counters: Arc<PumpCounters>,
    drain_event: Arc<Notify>,
    finished: Arc<std::sync::atomic::AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PumpHandle {
    /// Push bytes for `stream`, splitting at `chunk_size_bytes` so each
    /// enqueued `Chunk` is no larger than the configured limit (spec §3.5,
    /// §8.3 boundary behaviors).
    pub async fn push_output(&self, stream: StreamKind, bytes: &[u8]) -> Result<(), PumpError> {
        if bytes.is_empty() {
            return Ok(());
        }
        for piece in bytes.chunks(self.chunk_size_bytes.max(1)) {
            self.enqueue(OutputItem::Chunk {
                stream,
                bytes: piece.to_vec(),
            })
            .await?;
        }
        Ok(())
    }

    /// Enqueue a flush sentinel and await confirmation that every chunk
    /// enqueued before it has reached the transport (spec §4.4.4 drain
    /// fence). Resolves immediately if the pump is already empty.
    pub async fn drain(&self, timeout: Duration) -> Result<(), ExecutorError> {
        let (tx, rx) = oneshot::channel();
        if self.enqueue(OutputItem::Flush(tx)).await.is_err() {
            // Pump already stopped; nothing further will ever be sent, so
            // the drain is vacuously satisfied.
            return Ok(());
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(FlushOutcome::Flushed)) => Ok(()),
            Ok(Ok(FlushOutcome::TransportClosed)) => Err(ExecutorError::TransportClosed(
                crate::error::TransportError::Eof,
            )),
            Ok(Err(_)) => Err(ExecutorError::TransportClosed(
                crate::error::TransportError::Eof,
            )),
            Err(_) => Err(ExecutorError::DrainTimeout),
        }
    }

    /// Signal the pump task to stop after draining what's already queued.
    /// Idempotent: a second call after the task has exited is a no-op.
    pub async fn stop(&self) {
        let _ = self.enqueue(OutputItem::Stop).await;
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Resolves once the pump task has exited for any reason, so callers
    /// awaiting a flush that will never complete don't deadlock (spec
    /// §4.3: "On task exit for any reason, the `drain_event` is set").
    pub async fn wait_finished(&self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        self.drain_event.notified().await;
    }

    pub fn counters(&self) -> &PumpCounters {
        &self.counters
    }

    async fn enqueue(&self, item: OutputItem) -> Result<(), PumpError> {
        if self.queue.closed.load(Ordering::SeqCst) {
            return Err(PumpError::Dropped);
        }
        match self.policy {
            BackpressurePolicy::Block => loop {
                let mut items = self.queue.items.lock().await;
                if self.queue.closed.load(Ordering::SeqCst) {
                    return Err(PumpError::Dropped);
                }
                if items.len() < self.queue.capacity {
                    items.push_back(item);
                    drop(items);
                    self.queue.item_available.notify_one();
                    return Ok(());
                }
                drop(items);
                self.queue.space_available.notified().await;
            },
            BackpressurePolicy::DropNew => {
                let mut items = self.queue.items.lock().await;
                if items.len() >= self.queue.capacity {
                    self.counters.dropped_new.fetch_add(1, Ordering::Relaxed);
                    return Err(PumpError::Dropped);
                }
                items.push_back(item);
                drop(items);
                self.queue.item_available.notify_one();
                Ok(())
            }
            BackpressurePolicy::DropOldest => {
                let mut items = self.queue.items.lock().await;
                if items.len() >= self.queue.capacity {
                    items.pop_front();
                    self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                }
                items.push_back(item);
                drop(items);
                self.queue.item_available.notify_one();
                Ok(())
            }
            BackpressurePolicy::Error => {
                let mut items = self.queue.items.lock().await;
                if items.len() >= self.queue.capacity {
                    return Err(PumpError::BackpressureExceeded);
                }
                items.push_back(item);
                drop(items);
                self.queue.item_available.notify_one();
                Ok(())
            }
        }
    }
}

/// The stdout/stderr writer override a real evaluator installs into its
/// namespace (spec §4.4 step 1, §4.7: "the core also supplies, through the
/// namespace, a callable `input` and output redirectors"). Evaluation runs
/// synchronously on a dedicated OS thread, so this is a blocking facade over
/// `PumpHandle::push_output`, the same shape `InputShim::request` uses over
/// the same pump.
#[derive(Clone)]
pub struct OutputWriter {
    pump: Arc<PumpHandle>,
}

impl OutputWriter {
    pub fn new(pump: Arc<PumpHandle>) -> Self {
        Self { pump }
    }

    /// Blocking entry point called from the evaluator thread when user code
    /// writes to stdout/stderr. Must be called from a context where a tokio
    /// `Handle` is reachable (true of the dedicated `spawn_blocking` thread
    /// the executor runs evaluation on).
    pub fn write(&self, stream: StreamKind, bytes: &[u8]) -> Result<(), PumpError> {
        tokio::runtime::Handle::current().block_on(self.pump.push_output(stream, bytes))
    }
}

/// Spawn the pump task for one execution and return the producer-facing
/// handle. `sink.send` is called once per `Chunk`, wrapping it in an
/// `output` message tagged with `execution_id`.
pub fn spawn(
    execution_id: MessageId,
    sink: Arc<dyn OutputSink>,
    config: PumpConfig,
) -> PumpHandle {
    let queue = Arc::new(Queue {
        items: Mutex::new(VecDeque::new()),
        capacity: config.capacity.max(1),
        item_available: Notify::new(),
        space_available: Notify::new(),
        closed: std::sync::atomic::AtomicBool::new(false),
    });
    let drain_event = Arc::new(Notify::new());
    let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let task_queue = Arc::clone(&queue);
    let task_drain_event = Arc::clone(&drain_event);
    let task_finished = Arc::clone(&finished);

    let task = tokio::spawn(async move {
        pump_loop(execution_id, sink, task_queue).await;
        task_finished.store(true, Ordering::SeqCst);
        task_drain_event.notify_waiters();
    });

    PumpHandle {
        queue,
        policy: config.backpressure,
        chunk_size_bytes: config.chunk_size_bytes,
        counters: Arc::new(PumpCounters::default()),
        drain_event,
        finished,
        task: Mutex::new(Some(task)),
    }
}

async fn pump_loop(execution_id: MessageId, sink: Arc<dyn OutputSink>, queue: Arc<Queue>) {
    loop {
        let item = next_item(&queue).await;
        match item {
            OutputItem::Chunk { stream, bytes } => {
                let data = String::from_utf8_lossy(&bytes).into_owned();
                let msg = Message::new(MessageBody::Output {
                    execution_id,
                    stream,
                    data,
                    flush: None,
                });
                if sink.send(&msg).await.is_err() {
                    queue.closed.store(true, Ordering::SeqCst);
                    fail_all_pending_flushes(&queue).await;
                    return;
                }
            }
            OutputItem::Flush(tx) => {
                let _ = tx.send(FlushOutcome::Flushed);
            }
            OutputItem::Stop => {
                queue.closed.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

async fn next_item(queue: &Arc<Queue>) -> OutputItem {
    loop {
        let mut items = queue.items.lock().await;
        if let Some(item) = items.pop_front() {
            drop(items);
            queue.space_available.notify_one();
            return item;
        }
        drop(items);
        queue.item_available.notified().await;
    }
}

async fn fail_all_pending_flushes(queue: &Arc<Queue>) {
    let mut items = queue.items.lock().await;
    for item in items.drain(..) {
        if let OutputItem::Flush(tx) = item {
            let _ = tx.send(FlushOutcome::TransportClosed);
        }
    }
}
