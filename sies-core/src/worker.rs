//! The subprocess-side controller (spec §4.5): the sole reader of its
//! transport, dispatching `execute`/`input_response`/`cancel`/`interrupt`/
//! `checkpoint`/`restore`/`shutdown` while a heartbeat task runs alongside.
//!
//! Grounded on `ahma_mcp`'s `adapter.rs` main dispatch loop, which also
//! multiplexes an active child operation against new inbound commands
//! rather than blocking on one at a time.

use crate::error::ExecutorError;
use crate::evaluator::CodeEvaluator;
use crate::executor::{Executor, ExecutorConfig, ExecutionOutcome};
use crate::heartbeat::{DefaultHeartbeatSampler, HeartbeatSampler};
use crate::namespace::NamespaceStore;
use crate::transport::Transport;
use sies_common::MessageId;
use sies_wire::{ErrorKind, Message, MessageBody, RestoreMode, TransactionPolicy};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

/// Configuration for a worker loop, collecting spec §6.2's defaults that
/// apply at worker granularity.
#[derive(Clone)]
pub struct WorkerConfig {
    pub executor: ExecutorConfig,
    pub heartbeat_interval: Duration,
    /// Grace period for `interrupt` messages that don't name an
    /// `execution_id` (spec §4.5: "same as cancel with a default grace").
    /// Not specified numerically by the protocol; chosen shorter than the
    /// drain timeout so an unresponsive evaluator is detected promptly.
    pub default_interrupt_grace: Duration,
    pub ready_capabilities: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            default_interrupt_grace: Duration::from_secs(2),
            ready_capabilities: Vec::new(),
        }
    }
}

/// Counters exposed for telemetry (mirrors the pump's `PumpCounters`
/// pattern).
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub orphan_input_responses: AtomicU64,
}

/// Why the worker loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A `shutdown` message was handled to completion.
    Shutdown,
    /// An `interrupt{force_restart: true}` was handled; the caller should
    /// exit the process after this returns.
    ForceRestart,
}

struct ActiveExecution {
    execution_id: MessageId,
    executor: Arc<Executor>,
    task: JoinHandle<ExecutionOutcome>,
    transaction_policy: TransactionPolicy,
    /// Namespace snapshot taken before evaluation, only when
    /// `transaction_policy == DiscardOnError` (spec §3.1 `execute`;
    /// resolved in `sies-wire`'s `TransactionPolicy` doc comment: errors
    /// roll the namespace back to this snapshot).
    pre_snapshot: Option<Vec<u8>>,
}

/// The subprocess-side controller. Owns the transport's single reader seat
/// (spec §4.2, §4.5) and the lifecycle of at most one active execution.
pub struct Worker<W> {
    transport: Transport<W>,
    namespace: Arc<dyn NamespaceStore>,
    evaluator: Arc<dyn CodeEvaluator>,
    sampler: Arc<dyn HeartbeatSampler>,
    config: WorkerConfig,
    counters: Arc<WorkerCounters>,
    /// Set when a `cancel`/`interrupt` grace period expires without the
    /// evaluator thread exiting (spec §4.5 `cancel`: "mark the worker
    /// unhealthy so the controller restarts it"). Restarting the process
    /// is the controller's decision (spec §4.4.2); the worker only
    /// surfaces the flag.
    unhealthy: Arc<AtomicBool>,
}

impl<W> Worker<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        transport: Transport<W>,
        namespace: Arc<dyn NamespaceStore>,
        evaluator: Arc<dyn CodeEvaluator>,
        config: WorkerConfig,
    ) -> Self {
        Self::with_sampler(transport, namespace, evaluator, Arc::new(DefaultHeartbeatSampler), config)
    }

    pub fn with_sampler(
        transport: Transport<W>,
        namespace: Arc<dyn NamespaceStore>,
        evaluator: Arc<dyn CodeEvaluator>,
        sampler: Arc<dyn HeartbeatSampler>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            transport,
            namespace,
            evaluator,
            sampler,
            config,
            counters: Arc::new(WorkerCounters::default()),
            unhealthy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn counters(&self) -> &Arc<WorkerCounters> {
        &self.counters
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::SeqCst)
    }

    /// Run the worker to completion: announce `ready`, then dispatch
    /// inbound messages until `shutdown` or `interrupt{force_restart}`, or
    /// the transport fails.
    pub async fn run(mut self) -> Result<WorkerExit, ExecutorError> {
        self.send(MessageBody::Ready {
            capabilities: self.config.ready_capabilities.clone(),
        })
        .await;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut active: Option<ActiveExecution> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let sample = self.sampler.sample();
                    self.send(MessageBody::Heartbeat {
                        memory_bytes: sample.memory_bytes,
                        cpu_percent: sample.cpu_percent,
                        namespace_size: self.namespace.size(),
                    })
                    .await;
                }

                outcome = &mut active.as_mut().unwrap().task, if active.is_some() => {
                    let finished = active.take().expect("guarded by active.is_some()");
                    self.finish_execution(finished, outcome).await;
                }

                incoming = self.transport.recv() => {
                    match incoming {
                        Ok(msg) => {
                            if let Some(exit) = self.dispatch(msg, &mut active).await {
                                return Ok(exit);
                            }
                        }
                        Err(e) => return Err(ExecutorError::TransportClosed(e)),
                    }
                }
            }
        }
    }

    /// Handle one inbound message. Returns `Some(exit)` when the worker
    /// loop should stop.
    async fn dispatch(&mut self, msg: Message, active: &mut Option<ActiveExecution>) -> Option<WorkerExit> {
        match msg.body {
            MessageBody::Execute { code, transaction_policy, .. } => {
                self.handle_execute(msg.id, code, transaction_policy.unwrap_or_default(), active).await;
                None
            }
            MessageBody::InputResponse { input_id, data } => {
                self.handle_input_response(input_id, data, &*active);
                None
            }
            MessageBody::Cancel { execution_id, grace_ms } => {
                if let Some(exec) = active.as_ref() {
                    if exec.execution_id == execution_id {
                        self.cancel_with_timeout(exec, Duration::from_millis(grace_ms)).await;
                    }
                }
                None
            }
            MessageBody::Interrupt { force_restart } => {
                if let Some(exec) = active.as_ref() {
                    self.cancel_with_timeout(exec, self.config.default_interrupt_grace).await;
                }
                if force_restart.unwrap_or(false) {
                    self.shutdown_active(active.take()).await;
                    self.transport.close().await;
                    return Some(WorkerExit::ForceRestart);
                }
                None
            }
            MessageBody::Checkpoint { checkpoint_id, .. } => {
                self.handle_checkpoint(checkpoint_id).await;
                None
            }
            MessageBody::Restore { checkpoint_id, data, mode } => {
                self.handle_restore(checkpoint_id, data, mode).await;
                None
            }
            MessageBody::Shutdown { drain } => {
                self.shutdown_active_with_drain(active.take(), drain.unwrap_or(true)).await;
                self.transport.close().await;
                Some(WorkerExit::Shutdown)
            }
            // `output`/`result`/`error`/`ready`/`heartbeat` are outbound-only
            // from the worker's perspective; a peer sending one is a
            // protocol misuse the worker simply ignores.
            _ => None,
        }
    }

    async fn handle_execute(
        &self,
        id: MessageId,
        code: String,
        transaction_policy: TransactionPolicy,
        active: &mut Option<ActiveExecution>,
    ) {
        if active.is_some() {
            self.send(MessageBody::Error {
                execution_id: id,
                exception_type: ErrorKind::Busy.exception_type().to_string(),
                message: "an execution is already in flight on this worker".to_string(),
                traceback: None,
                kind: Some(ErrorKind::Busy),
            })
            .await;
            return;
        }

        let pre_snapshot = matches!(transaction_policy, TransactionPolicy::DiscardOnError)
            .then(|| self.namespace.snapshot());

        let sink: Arc<dyn crate::sink::OutputSink> = Arc::new(self.transport.clone());
        let executor = Arc::new(Executor::new(id, Arc::clone(&self.namespace), sink, self.config.executor));
        let run_executor = Arc::clone(&executor);
        let evaluator = Arc::clone(&self.evaluator);
        let task = tokio::spawn(async move { run_executor.run(code, evaluator).await });

        *active = Some(ActiveExecution {
            execution_id: id,
            executor,
            task,
            transaction_policy,
            pre_snapshot,
        });
    }

    fn handle_input_response(&self, input_id: MessageId, data: String, active: &Option<ActiveExecution>) {
        let resolved = active
            .as_ref()
            .map(|exec| exec.executor.input_shim().resolve(input_id, data))
            .unwrap_or(false);
        if !resolved {
            self.counters.orphan_input_responses.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%input_id, "input_response did not match any pending waiter");
        }
    }

    /// Cancellation protocol, worker side (spec §4.5 `cancel`/`interrupt`):
    /// trip the token, then wait up to `grace` for the evaluator thread to
    /// exit on its own. If it doesn't, mark the worker unhealthy —
    /// escalating to a worker restart is a controller-side decision (spec
    /// §4.4.2: "such cases escalate to hard interrupt at the session
    /// layer"), so this worker only surfaces the flag.
    async fn cancel_with_timeout(&self, exec: &ActiveExecution, grace: Duration) {
        exec.executor.cancel();
        tokio::time::sleep(grace).await;
        if !exec.task.is_finished() {
            self.unhealthy.store(true, Ordering::SeqCst);
            tracing::warn!(
                execution_id = %exec.execution_id,
                "evaluator thread did not exit within the cancel grace period"
            );
        }
    }

    async fn handle_checkpoint(&self, checkpoint_id: String) {
        let snapshot = self.namespace.snapshot();
        let key_count = self.namespace.size();
        let data = String::from_utf8(snapshot).ok();
        self.send(MessageBody::Checkpoint {
            checkpoint_id,
            data,
            key_count: Some(key_count),
        })
        .await;
        self.send(MessageBody::Ready {
            capabilities: self.config.ready_capabilities.clone(),
        })
        .await;
    }

    async fn handle_restore(&self, _checkpoint_id: Option<String>, data: Option<String>, mode: Option<RestoreMode>) {
        if let Some(data) = data {
            self.namespace.restore(data.as_bytes(), mode.unwrap_or(RestoreMode::Merge));
        } else {
            tracing::warn!("restore requested with no inline data and no checkpoint store to resolve an id against");
        }
        self.send(MessageBody::Ready {
            capabilities: self.config.ready_capabilities.clone(),
        })
        .await;
    }

    /// Shutdown teardown (spec §4.5 `shutdown`): if `drain` is true, await
    /// the active execution's natural completion and send its terminal
    /// message; otherwise cancel it immediately and drop the result.
    async fn shutdown_active_with_drain(&self, active: Option<ActiveExecution>, drain: bool) {
        let Some(mut exec) = active else { return };
        if drain {
            let outcome = (&mut exec.task).await;
            self.finish_execution(exec, outcome).await;
        } else {
            exec.executor.cancel();
            exec.task.abort();
        }
    }

    async fn shutdown_active(&self, active: Option<ActiveExecution>) {
        self.shutdown_active_with_drain(active, false).await;
    }

    /// Build and send the terminal message for a finished execution, then
    /// apply `DiscardOnError` rollback if the outcome was not a clean
    /// `Result` (spec §3.1 `execute.transaction_policy`).
    async fn finish_execution(&self, exec: ActiveExecution, outcome: Result<ExecutionOutcome, tokio::task::JoinError>) {
        let execution_id = exec.execution_id;
        let is_result = matches!(outcome, Ok(ExecutionOutcome::Result { .. }));
        if !is_result {
            if let (TransactionPolicy::DiscardOnError, Some(snapshot)) = (exec.transaction_policy, &exec.pre_snapshot) {
                self.namespace.restore(snapshot, RestoreMode::ClearThenMerge);
            }
        }
        let body = match outcome {
            Ok(ExecutionOutcome::Result { value, repr, execution_time_ms }) => MessageBody::Result {
                execution_id,
                value,
                repr,
                execution_time_ms,
            },
            Ok(ExecutionOutcome::UserException { exception_type, message, traceback }) => MessageBody::Error {
                execution_id,
                exception_type,
                message,
                traceback,
                kind: None,
            },
            Ok(ExecutionOutcome::Cancelled { message }) => MessageBody::Error {
                execution_id,
                exception_type: ErrorKind::Cancelled.exception_type().to_string(),
                message,
                traceback: None,
                kind: Some(ErrorKind::Cancelled),
            },
            Ok(ExecutionOutcome::DrainTimeout) => MessageBody::Error {
                execution_id,
                exception_type: ErrorKind::OutputDrainTimeout.exception_type().to_string(),
                message: "output drain fence did not confirm within the configured timeout".to_string(),
                traceback: None,
                kind: Some(ErrorKind::OutputDrainTimeout),
            },
            Err(join_err) => MessageBody::Error {
                execution_id,
                exception_type: "EvaluatorPanic".to_string(),
                message: join_err.to_string(),
                traceback: None,
                kind: None,
            },
        };
        self.send(body).await;
    }

    async fn send(&self, body: MessageBody) {
        let _ = self.transport.send(&Message::new(body)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::test_support::{CancellableLoop, ConstantEvaluator};
    use crate::namespace::InMemoryNamespace;
    use sies_wire::TransactionPolicy;
    use std::time::Duration as StdDuration;
    use tokio::io::duplex;

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            executor: ExecutorConfig {
                cancel_check_interval: 1,
                drain_timeout: StdDuration::from_millis(500),
                ..Default::default()
            },
            heartbeat_interval: StdDuration::from_secs(3600),
            default_interrupt_grace: StdDuration::from_millis(100),
            ready_capabilities: vec!["test".into()],
        }
    }

    async fn client_pair() -> (
        Transport<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        Worker<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (client, server) = duplex(16 * 1024);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let client_transport = Transport::open(client_r, client_w, crate::transport::TransportConfig::default());
        let server_transport = Transport::open(server_r, server_w, crate::transport::TransportConfig::default());
        let worker = Worker::new(
            server_transport,
            Arc::new(InMemoryNamespace::new()),
            Arc::new(ConstantEvaluator(serde_json::json!(42))),
            worker_config(),
        );
        (client_transport, worker)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn announces_ready_then_answers_one_execution() {
        let (client, worker) = client_pair().await;
        let worker_task = tokio::spawn(worker.run());

        let ready = client.recv().await.unwrap();
        assert!(matches!(ready.body, MessageBody::Ready { .. }));

        client
            .send(&Message::new(MessageBody::Execute {
                code: "2+2".into(),
                capture_source: None,
                transaction_policy: Some(TransactionPolicy::Commit),
            }))
            .await
            .unwrap();
        let result = client.recv().await.unwrap();
        assert!(matches!(result.body, MessageBody::Result { value, .. } if value == serde_json::json!(42)));

        client.send(&Message::new(MessageBody::Shutdown { drain: Some(true) })).await.unwrap();
        let exit = worker_task.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::Shutdown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_execute_while_busy_is_rejected() {
        let (client, mut worker) = client_pair().await;
        worker.evaluator = Arc::new(CancellableLoop);
        let worker_task = tokio::spawn(worker.run());
        client.recv().await.unwrap(); // ready

        let exec_msg = Message::new(MessageBody::Execute {
            code: "loop".into(),
            capture_source: None,
            transaction_policy: None,
        });
        client.send(&exec_msg).await.unwrap();

        let busy_probe = Message::new(MessageBody::Execute {
            code: "2".into(),
            capture_source: None,
            transaction_policy: None,
        });
        client.send(&busy_probe).await.unwrap();
        let busy = client.recv().await.unwrap();
        match busy.body {
            MessageBody::Error { execution_id, kind: Some(ErrorKind::Busy), .. } => {
                assert_eq!(execution_id, busy_probe.id);
            }
            other => panic!("expected Busy error, got {other:?}"),
        }

        client
            .send(&Message::new(MessageBody::Cancel {
                execution_id: exec_msg.id,
                grace_ms: 10,
            }))
            .await
            .unwrap();
        let cancelled = client.recv().await.unwrap();
        assert!(matches!(cancelled.body, MessageBody::Error { kind: Some(ErrorKind::Cancelled), .. }));

        client.send(&Message::new(MessageBody::Shutdown { drain: Some(true) })).await.unwrap();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn orphan_input_response_increments_counter() {
        let (client, worker) = client_pair().await;
        let counters = Arc::clone(worker.counters());
        let worker_task = tokio::spawn(worker.run());
        client.recv().await.unwrap(); // ready

        client
            .send(&Message::new(MessageBody::InputResponse {
                input_id: MessageId::new(),
                data: "orphan".into(),
            }))
            .await
            .unwrap();

        // Give the dispatch loop a moment to process before shutting down.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(counters.orphan_input_responses.load(Ordering::SeqCst), 1);

        client.send(&Message::new(MessageBody::Shutdown { drain: Some(true) })).await.unwrap();
        worker_task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn checkpoint_round_trips_through_restore() {
        let (client, worker) = client_pair().await;
        let worker_task = tokio::spawn(worker.run());
        client.recv().await.unwrap(); // ready

        client
            .send(&Message::new(MessageBody::Checkpoint {
                checkpoint_id: "cp-1".into(),
                data: None,
                key_count: None,
            }))
            .await
            .unwrap();
        let checkpoint = client.recv().await.unwrap();
        let data = match checkpoint.body {
            MessageBody::Checkpoint { checkpoint_id, data, .. } => {
                assert_eq!(checkpoint_id, "cp-1");
                data
            }
            other => panic!("expected Checkpoint, got {other:?}"),
        };
        assert!(matches!(client.recv().await.unwrap().body, MessageBody::Ready { .. }));

        client
            .send(&Message::new(MessageBody::Restore {
                checkpoint_id: Some("cp-1".into()),
                data,
                mode: Some(RestoreMode::Merge),
            }))
            .await
            .unwrap();
        assert!(matches!(client.recv().await.unwrap().body, MessageBody::Ready { .. }));

        client.send(&Message::new(MessageBody::Shutdown { drain: Some(true) })).await.unwrap();
        worker_task.await.unwrap().unwrap();
    }
}
