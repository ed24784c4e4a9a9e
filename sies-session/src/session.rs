//! The controller-side session (spec.md §3.2, §4.6, §6.3): lifecycle state
//! machine, sole-reader receive loop, interceptor list, and the `execute()`
//! streaming API.
//!
//! Grounded in `ahma_http_bridge::session`'s `Session`/`handle_session_io`:
//! a per-session outgoing channel guarded against restart, a single
//! `tokio::select!`-free read loop (here a plain `recv` loop, since the
//! transport already multiplexes reader/writer internally), and
//! `AtomicBool`/state-flag tracking of lifecycle. The watermark on restart
//! (`Terminated -> Creating` with a reset cancel-flag) mirrors the
//! teacher's subprocess-restart-with-handshake-replay path.

use crate::error::SessionError;
use crate::interceptor::{InterceptorHandle, InterceptorList, MessageInterceptor};
use async_trait::async_trait;
use futures::Stream;
use sies_common::MessageId;
use sies_core::{Transport, TransportError};
use sies_wire::{ErrorKind, Message, MessageBody, RestoreMode, TransactionPolicy};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// A session's position in spec.md §3.2's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Warming,
    Ready,
    Idle,
    Busy,
    Terminating,
    Terminated,
}

pub type SessionId = MessageId;

/// Startup/runtime tuning (spec.md §6.2's session-relevant rows).
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub ready_timeout: Duration,
    pub interceptor_budget: Duration,
    pub default_cancel_grace: Duration,
    pub transport: sies_core::TransportConfig,
    pub inbound_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_millis(5000),
            interceptor_budget: Duration::from_millis(10),
            default_cancel_grace: Duration::from_millis(500),
            transport: sies_core::TransportConfig::default(),
            inbound_queue_capacity: 256,
        }
    }
}

/// One heartbeat as observed by the session (spec.md §3.1 `heartbeat`, with
/// the time it arrived attached for staleness checks).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSnapshot {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub namespace_size: u64,
    pub received_at: Instant,
}

/// Structured counters returned by [`Session::info`] (spec.md §6.3 `info()`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionMetrics {
    pub executions_started: u64,
    pub executions_completed: u64,
    pub busy_rejections: u64,
}

/// Snapshot returned by [`Session::info`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub state: SessionState,
    pub last_heartbeat: Option<HeartbeatSnapshot>,
    pub metrics: SessionMetrics,
}

/// Produces a fresh `(Transport, Option<Child>)` pair on `start()`/
/// `restart()`. Generalizes a direct `Command::spawn` call so
/// tests can substitute an in-memory `tokio::io::duplex` pair instead of a
/// real subprocess. See [`crate::process::ProcessSpawner`] for the
/// production implementation.
#[async_trait]
pub trait SessionSpawner<W>: Send + Sync
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn spawn(&self) -> Result<(Transport<W>, Option<Child>), SessionError>;
}

struct ActiveExecution {
    execution_id: MessageId,
    tx: mpsc::Sender<Message>,
}

/// A `watch`-backed counter bumped once per `ready` observed on the wire.
/// `checkpoint`/`restore`/`start` all want to await "the next `ready` after
/// the one I just triggered"; a plain `Notify` risks losing a wakeup that
/// fires between the check and the subscribe, so a monotonically
/// increasing counter is used instead — `watch::Receiver::borrow` always
/// reflects the latest value regardless of timing.
struct ReadySignal {
    tx: watch::Sender<u64>,
}

impl ReadySignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    fn bump(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn baseline(&self) -> u64 {
        *self.tx.subscribe().borrow()
    }

    async fn wait_for_next(&self, baseline: u64, timeout: Duration) -> Result<(), ()> {
        let mut rx = self.tx.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            if *rx.borrow() > baseline {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(());
            }
            if tokio::time::timeout(remaining, rx.changed()).await.is_err() {
                return Err(());
            }
        }
    }
}

struct Inner<W: AsyncWrite + Unpin + Send + 'static> {
    id: SessionId,
    spawner: Arc<dyn SessionSpawner<W>>,
    config: SessionConfig,
    state: sies_common::StateMachine<SessionState>,
    transport: Mutex<Option<Transport<W>>>,
    process: Mutex<Option<Child>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    interceptors: InterceptorList,
    cancel_flag: AtomicBool,
    active: Mutex<Option<ActiveExecution>>,
    ready: ReadySignal,
    last_heartbeat: Mutex<Option<HeartbeatSnapshot>>,
    executions_started: AtomicU64,
    executions_completed: AtomicU64,
    busy_rejections: AtomicU64,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Inner<W> {
    async fn transport_handle(&self) -> Result<Transport<W>, SessionError> {
        self.transport
            .lock()
            .await
            .clone()
            .ok_or(SessionError::Terminated)
    }

    async fn route(&self, msg: &Message) {
        match &msg.body {
            MessageBody::Output { execution_id, .. } | MessageBody::Input { execution_id, .. } => {
                self.forward_to_active(*execution_id, msg.clone(), false).await;
            }
            MessageBody::Result { execution_id, .. } | MessageBody::Error { execution_id, .. } => {
                self.forward_to_active(*execution_id, msg.clone(), true).await;
            }
            MessageBody::Heartbeat {
                memory_bytes,
                cpu_percent,
                namespace_size,
            } => {
                *self.last_heartbeat.lock().await = Some(HeartbeatSnapshot {
                    memory_bytes: *memory_bytes,
                    cpu_percent: *cpu_percent,
                    namespace_size: *namespace_size,
                    received_at: Instant::now(),
                });
            }
            MessageBody::Ready { .. } => {
                self.ready.bump();
            }
            _ => {}
        }
    }

    async fn forward_to_active(&self, execution_id: MessageId, msg: Message, terminal: bool) {
        let matched_tx = {
            let guard = self.active.lock().await;
            match guard.as_ref() {
                Some(active) if active.execution_id == execution_id => Some(active.tx.clone()),
                _ => None,
            }
        };
        let Some(tx) = matched_tx else {
            return;
        };
        let _ = tx.send(msg).await;
        if terminal {
            let mut guard = self.active.lock().await;
            if matches!(guard.as_ref(), Some(a) if a.execution_id == execution_id) {
                *guard = None;
            }
            drop(guard);
            self.state
                .transition(|s| if *s == SessionState::Busy { *s = SessionState::Idle });
            self.executions_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn on_transport_failure(&self, err: TransportError) {
        self.state.transition(|s| *s = SessionState::Terminated);
        if let Some(active) = self.active.lock().await.take() {
            let msg = Message::new(MessageBody::Error {
                execution_id: active.execution_id,
                exception_type: ErrorKind::TransportClosed.exception_type().to_string(),
                message: format!("transport closed mid-execution: {err}"),
                traceback: None,
                kind: Some(ErrorKind::TransportClosed),
            });
            let _ = active.tx.send(msg).await;
        }
    }
}

async fn receive_loop<W: AsyncWrite + Unpin + Send + 'static>(
    inner: Arc<Inner<W>>,
    transport: Transport<W>,
) {
    loop {
        match transport.recv().await {
            Ok(msg) => {
                inner.interceptors.dispatch(&msg);
                inner.route(&msg).await;
            }
            Err(err) => {
                inner.on_transport_failure(err).await;
                return;
            }
        }
    }
}

/// The controller-side counterpart to a worker subprocess (spec.md §4.6).
/// Cheap to clone: internally `Arc`-backed so the pool, the bridge, and
/// caller code can all hold a handle.
pub struct Session<W: AsyncWrite + Unpin + Send + 'static> {
    inner: Arc<Inner<W>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Clone for Session<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> Session<W> {
    pub fn new(id: SessionId, spawner: Arc<dyn SessionSpawner<W>>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                spawner,
                config,
                state: sies_common::StateMachine::new(SessionState::Creating),
                transport: Mutex::new(None),
                process: Mutex::new(None),
                receive_task: Mutex::new(None),
                interceptors: InterceptorList::new(config.interceptor_budget),
                cancel_flag: AtomicBool::new(false),
                active: Mutex::new(None),
                ready: ReadySignal::new(),
                last_heartbeat: Mutex::new(None),
                executions_started: AtomicU64::new(0),
                executions_completed: AtomicU64::new(0),
                busy_rejections: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Spawns the worker, opens its transport, and blocks until the
    /// worker's first `ready` or `ready_timeout` elapses (spec.md §4.6
    /// "Startup").
    pub async fn start(&self) -> Result<(), SessionError> {
        self.inner.state.transition(|s| *s = SessionState::Creating);
        let (transport, child) = self.inner.spawner.spawn().await?;
        self.inner.state.transition(|s| *s = SessionState::Warming);

        *self.inner.transport.lock().await = Some(transport.clone());
        *self.inner.process.lock().await = child;

        let baseline = self.inner.ready.baseline();
        let task = tokio::spawn(receive_loop(Arc::clone(&self.inner), transport));
        *self.inner.receive_task.lock().await = Some(task);

        self.inner
            .ready
            .wait_for_next(baseline, self.inner.config.ready_timeout)
            .await
            .map_err(|_| SessionError::ReadyTimeout(self.inner.config.ready_timeout))?;

        // `Ready` is the one-shot startup announcement (spec.md §3.2's
        // lifecycle arrow); a session immediately falls through to `Idle`,
        // the steady state `execute()` actually gates on.
        self.inner.state.transition(|s| *s = SessionState::Ready);
        self.inner.state.transition(|s| *s = SessionState::Idle);
        Ok(())
    }

    /// Returns an async stream of every message belonging to this
    /// execution, ending with (and including) its terminal message (spec.md
    /// §6.3 `execute()`). A concurrent call while one is already in flight
    /// fails immediately with [`SessionError::Busy`] (spec.md §3.2).
    pub async fn execute(
        &self,
        code: impl Into<String>,
        capture_source: Option<bool>,
        transaction_policy: Option<TransactionPolicy>,
    ) -> Result<ExecuteStream<W>, SessionError> {
        let transport = self.inner.transport_handle().await?;

        let msg = Message::new(MessageBody::Execute {
            code: code.into(),
            capture_source,
            transaction_policy,
        });
        let execution_id = msg.id;
        let (tx, rx) = mpsc::channel(self.inner.config.inbound_queue_capacity);

        {
            let mut active = self.inner.active.lock().await;
            if active.is_some() {
                self.inner.busy_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(SessionError::Busy);
            }
            *active = Some(ActiveExecution { execution_id, tx });
        }
        self.inner.state.transition(|s| *s = SessionState::Busy);
        self.inner.executions_started.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = transport.send(&msg).await {
            *self.inner.active.lock().await = None;
            self.inner.state.transition(|s| *s = SessionState::Idle);
            return Err(err.into());
        }

        Ok(ExecuteStream {
            inner: ReceiverStream::new(rx),
            session: self.clone(),
            execution_id,
            grace: self.inner.config.default_cancel_grace,
            completed: false,
        })
    }

    /// Sends an `input_response` to the worker (spec.md §4.6). Not ordered
    /// with respect to the execution's own output stream.
    pub async fn input_response(
        &self,
        input_id: MessageId,
        data: impl Into<String>,
    ) -> Result<(), SessionError> {
        let transport = self.inner.transport_handle().await?;
        transport
            .send(&Message::new(MessageBody::InputResponse {
                input_id,
                data: data.into(),
            }))
            .await?;
        Ok(())
    }

    pub async fn cancel(&self, execution_id: MessageId, grace_ms: u64) -> Result<(), SessionError> {
        let transport = self.inner.transport_handle().await?;
        transport
            .send(&Message::new(MessageBody::Cancel {
                execution_id,
                grace_ms,
            }))
            .await?;
        Ok(())
    }

    pub async fn interrupt(&self, force_restart: Option<bool>) -> Result<(), SessionError> {
        let transport = self.inner.transport_handle().await?;
        transport
            .send(&Message::new(MessageBody::Interrupt { force_restart }))
            .await?;
        if force_restart == Some(true) {
            self.inner.cancel_flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Requests a namespace snapshot and waits for the worker's follow-up
    /// `ready` (spec.md §4.5 "checkpoint": "send `checkpoint{...}` followed
    /// by `ready` for sync").
    pub async fn checkpoint(&self, checkpoint_id: impl Into<String>) -> Result<(), SessionError> {
        let transport = self.inner.transport_handle().await?;
        let baseline = self.inner.ready.baseline();
        transport
            .send(&Message::new(MessageBody::Checkpoint {
                checkpoint_id: checkpoint_id.into(),
                data: None,
                key_count: None,
            }))
            .await?;
        self.inner
            .ready
            .wait_for_next(baseline, self.inner.config.ready_timeout)
            .await
            .map_err(|_| SessionError::ReadyTimeout(self.inner.config.ready_timeout))
    }

    pub async fn restore(
        &self,
        checkpoint_id: Option<String>,
        data: Option<String>,
        mode: RestoreMode,
    ) -> Result<(), SessionError> {
        let transport = self.inner.transport_handle().await?;
        let baseline = self.inner.ready.baseline();
        transport
            .send(&Message::new(MessageBody::Restore {
                checkpoint_id,
                data,
                mode: Some(mode),
            }))
            .await?;
        self.inner
            .ready
            .wait_for_next(baseline, self.inner.config.ready_timeout)
            .await
            .map_err(|_| SessionError::ReadyTimeout(self.inner.config.ready_timeout))
    }

    /// Hard stop: closes the transport, aborts the receive loop, kills the
    /// process if one is owned. Does not reset the cancel-flag — that is
    /// `restart()`'s job (spec.md §3.2 "Restart path").
    pub async fn terminate(&self) -> Result<(), SessionError> {
        self.inner.state.transition(|s| *s = SessionState::Terminating);
        if let Some(transport) = self.inner.transport.lock().await.take() {
            transport.close().await;
        }
        if let Some(task) = self.inner.receive_task.lock().await.take() {
            task.abort();
        }
        if let Some(mut child) = self.inner.process.lock().await.take() {
            let _ = child.kill().await;
        }
        self.inner.state.transition(|s| *s = SessionState::Terminated);
        Ok(())
    }

    /// Asks the worker to drain and shut down cleanly, then tears down the
    /// controller side.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        if let Ok(transport) = self.inner.transport_handle().await {
            let _ = transport
                .send(&Message::new(MessageBody::Shutdown { drain: Some(true) }))
                .await;
        }
        self.terminate().await
    }

    /// Tears down and re-spawns, resetting the cancel-flag so new
    /// executions are not pre-cancelled (spec.md §3.2 "Restart path").
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.terminate().await?;
        self.inner.cancel_flag.store(false, Ordering::SeqCst);
        self.start().await
    }

    pub async fn is_alive(&self) -> bool {
        if matches!(
            self.inner.state.get(),
            SessionState::Terminating | SessionState::Terminated
        ) {
            return false;
        }
        match self.inner.process.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    pub fn add_message_interceptor(&self, interceptor: Arc<dyn MessageInterceptor>) -> InterceptorHandle {
        self.inner.interceptors.add(interceptor)
    }

    pub fn remove_message_interceptor(&self, handle: InterceptorHandle) {
        self.inner.interceptors.remove(handle)
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            state: self.inner.state.get(),
            last_heartbeat: *self.inner.last_heartbeat.lock().await,
            metrics: SessionMetrics {
                executions_started: self.inner.executions_started.load(Ordering::Relaxed),
                executions_completed: self.inner.executions_completed.load(Ordering::Relaxed),
                busy_rejections: self.inner.busy_rejections.load(Ordering::Relaxed),
            },
        }
    }
}

/// Test-only escape hatch for fixtures (e.g. the pool's tests) that need a
/// session in `Idle` state without driving a real handshake.
#[cfg(test)]
impl<W: AsyncWrite + Unpin + Send + 'static> Session<W> {
    pub(crate) fn mark_ready_for_test(&self) {
        self.inner.state.transition(|s| *s = SessionState::Ready);
        self.inner.state.transition(|s| *s = SessionState::Idle);
    }
}

/// The stream returned by [`Session::execute`]. Dropping it before the
/// terminal message arrives sends a `cancel` with the session's configured
/// grace (spec.md §6.3 "Cancelling the stream sends a `cancel`...").
pub struct ExecuteStream<W: AsyncWrite + Unpin + Send + 'static> {
    inner: ReceiverStream<Message>,
    session: Session<W>,
    execution_id: MessageId,
    grace: Duration,
    completed: bool,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Stream for ExecuteStream<W> {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_next(cx);
        match &poll {
            Poll::Ready(Some(msg)) if msg.body.is_terminal() => this.completed = true,
            Poll::Ready(None) => this.completed = true,
            _ => {}
        }
        poll
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> Drop for ExecuteStream<W> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let session = self.session.clone();
        let execution_id = self.execution_id;
        let grace_ms = self.grace.as_millis() as u64;
        tokio::spawn(async move {
            let _ = session.cancel(execution_id, grace_ms).await;
        });
    }
}
