//! The per-execution engine (spec §4.4): wires one `execute` to the output
//! pump, the `input()` shim, and the cancel tracer, and enforces the
//! drain-before-result invariant (spec §4.4.4) as a hard, testable
//! guarantee.
//!
//! Grounded on `ahma_mcp`'s `adapter`/`operation_monitor` pairing: the
//! adapter drives one external process end to end while the monitor tracks
//! its cancellation token and completion notifier; here one `Executor`
//! plays both roles for a single execution rather than splitting them
//! across two collaborators, since an execution's lifetime is always one
//! pump + one cancel token + one namespace handle.

use crate::cancel::{CancelTracer, DEFAULT_CHECK_INTERVAL};
use crate::error::ExecutorError;
use crate::evaluator::{CodeEvaluator, EvalOutcome};
use crate::input_shim::InputShim;
use crate::namespace::NamespaceStore;
use crate::pump::{self, BackpressurePolicy, OutputWriter, PumpConfig, PumpHandle};
use crate::sink::OutputSink;
use sies_common::MessageId;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for one executor, collecting spec §6.2's defaults that
/// apply at execution granularity.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub output_queue_maxsize: usize,
    pub backpressure: BackpressurePolicy,
    pub chunk_size_bytes: usize,
    pub drain_timeout: Duration,
    pub cancel_check_interval: u64,
    pub input_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            output_queue_maxsize: 1024,
            backpressure: BackpressurePolicy::Block,
            chunk_size_bytes: 65536,
            drain_timeout: Duration::from_secs(5),
            cancel_check_interval: DEFAULT_CHECK_INTERVAL,
            input_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            capacity: self.output_queue_maxsize,
            backpressure: self.backpressure,
            chunk_size_bytes: self.chunk_size_bytes,
        }
    }
}

/// What one execution ends in, after the drain fence has been resolved one
/// way or another. The caller (the worker loop) maps this onto the wire's
/// `result`/`error` messages.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Result {
        value: serde_json::Value,
        repr: String,
        execution_time_ms: u64,
    },
    UserException {
        exception_type: String,
        message: String,
        traceback: Option<String>,
    },
    /// Cancellation propagated to the evaluator (spec §4.4.3: "the executor
    /// proceeds to drain and emit an error whose kind indicates
    /// cancellation").
    Cancelled { message: String },
    /// The drain fence did not confirm within `drain_timeout` (spec
    /// §4.4.4). No `Result` is ever returned in this case, by construction.
    DrainTimeout,
}

/// The per-execution engine (spec §3.3). Constructed fresh for every
/// `execute` and torn down before the terminal message is emitted.
pub struct Executor {
    execution_id: MessageId,
    namespace: Arc<dyn NamespaceStore>,
    tracer: CancelTracer,
    pump: Arc<PumpHandle>,
    input: Arc<InputShim>,
    config: ExecutorConfig,
}

impl Executor {
    /// Prepare step (spec §4.4 step 1): reset the cancel token, bind
    /// `input` into the namespace if this is the namespace's first
    /// execution, and start the pump task before any user code runs.
    pub fn new(
        execution_id: MessageId,
        namespace: Arc<dyn NamespaceStore>,
        sink: Arc<dyn OutputSink>,
        config: ExecutorConfig,
    ) -> Self {
        let pump = Arc::new(pump::spawn(execution_id, Arc::clone(&sink), config.pump_config()));
        let input = Arc::new(InputShim::new(
            execution_id,
            Arc::clone(&pump),
            Arc::clone(&sink),
            config.input_timeout,
        ));
        if !namespace.has_input_binding() {
            namespace.bind_input();
        }
        if !namespace.has_output_binding() {
            namespace.bind_output();
        }
        Self {
            execution_id,
            namespace,
            tracer: CancelTracer::new(config.cancel_check_interval),
            pump,
            input,
            config,
        }
    }

    pub fn execution_id(&self) -> MessageId {
        self.execution_id
    }

    /// A handle other code (the output-redirector a real evaluator installs)
    /// can push stdout/stderr chunks through.
    pub fn pump(&self) -> &Arc<PumpHandle> {
        &self.pump
    }

    /// The shim a real evaluator binds as the namespace's `input()` symbol.
    pub fn input_shim(&self) -> &Arc<InputShim> {
        &self.input
    }

    /// Cancellation protocol, executor side (spec §4.4.3): trips the token
    /// so the next tracer check raises inside the evaluator, and completes
    /// every pending `input()` waiter with `Cancelled` immediately rather
    /// than waiting for the tracer to get there.
    pub fn cancel(&self) {
        self.tracer.cancel();
        self.input.cancel_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.tracer.is_cancelled()
    }

    /// Run `code` end to end: evaluate on a dedicated OS thread (spec §4.4
    /// step 3), drain the pump (step 5), and return the terminal outcome
    /// (step 6). Always tears down (step 7) before returning, regardless of
    /// outcome.
    pub async fn run(&self, code: String, evaluator: Arc<dyn CodeEvaluator>) -> ExecutionOutcome {
        let started = Instant::now();
        let namespace = Arc::clone(&self.namespace);
        let tracer = self.tracer.clone();
        let input = Arc::clone(&self.input);
        let output = OutputWriter::new(Arc::clone(&self.pump));

        let eval_result = tokio::task::spawn_blocking(move || {
            evaluator.evaluate(&code, &namespace, &tracer, &input, &output)
        })
        .await;

        let execution_time_ms = started.elapsed().as_millis() as u64;

        let outcome = match eval_result {
            Ok(outcome) => self.classify(outcome, execution_time_ms),
            Err(join_err) => ExecutionOutcome::UserException {
                exception_type: "EvaluatorPanic".to_string(),
                message: join_err.to_string(),
                traceback: None,
            },
        };

        let outcome = match self.drain().await {
            Ok(()) => outcome,
            Err(_) => ExecutionOutcome::DrainTimeout,
        };

        self.teardown().await;
        outcome
    }

    fn classify(&self, outcome: EvalOutcome, execution_time_ms: u64) -> ExecutionOutcome {
        if self.tracer.is_cancelled() {
            let message = match &outcome {
                EvalOutcome::Exception { message, .. } => message.clone(),
                EvalOutcome::Value { .. } => "execution was cancelled".to_string(),
            };
            return ExecutionOutcome::Cancelled { message };
        }
        match outcome {
            EvalOutcome::Value { value, repr } => {
                self.namespace.record_expression_result(value.clone());
                ExecutionOutcome::Result {
                    value,
                    repr,
                    execution_time_ms,
                }
            }
            EvalOutcome::Exception {
                exception_type,
                message,
                traceback,
            } => ExecutionOutcome::UserException {
                exception_type,
                message,
                traceback,
            },
        }
    }

    /// The drain-before-result invariant (spec §4.4.4): enqueue a flush
    /// sentinel and await confirmation that everything enqueued before it
    /// reached the transport.
    async fn drain(&self) -> Result<(), ExecutorError> {
        self.pump.drain(self.config.drain_timeout).await
    }

    /// Teardown (spec §4.4 step 7): stop the pump, complete any pending
    /// `input()` waiters with `ShutdownDuringInput`. The injected `input`
    /// binding itself is left on the namespace — it persists across
    /// executions.
    async fn teardown(&self) {
        self.input.shutdown_all();
        self.pump.stop().await;
    }
}
