//! End-to-end session/worker scenarios (spec.md §8.4 S1-S3, S5-S6), driving
//! a real `sies_core::Worker` over an in-memory duplex pair against a real
//! `Session`, instead of faking one side by hand the way the unit tests in
//! `session.rs` and `worker.rs` each do individually. S4 (drain timeout)
//! needs a transport send that stalls indefinitely, which this harness's
//! session-owned receive loop always drains around; that scenario is
//! exercised instead at the `Executor` level in `sies-core`, where the
//! stall can be injected directly into the `OutputSink` (see
//! `executor::tests::drain_timeout_suppresses_result`).

use async_trait::async_trait;
use sies_core::cancel::CancelTracer;
use sies_core::input_shim::InputShim;
use sies_core::pump::OutputWriter;
use sies_core::{CodeEvaluator, EvalOutcome, InMemoryNamespace, NamespaceStore};
use sies_core::{Transport, TransportConfig, Worker, WorkerConfig};
use sies_session::{Session, SessionConfig, SessionError, SessionId, SessionSpawner, SessionState};
use sies_session::{PoolConfig, SessionFactory, SessionPool};
use sies_wire::{ErrorKind, MessageBody, StreamKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split, DuplexStream, WriteHalf};
use tokio::process::Child;

/// Always returns a fixed value (spec.md §8.4 S1).
struct ConstantEvaluator(serde_json::Value);

impl CodeEvaluator for ConstantEvaluator {
    fn evaluate(
        &self,
        _code: &str,
        _ns: &Arc<dyn NamespaceStore>,
        _tracer: &CancelTracer,
        _input: &InputShim,
        _output: &OutputWriter,
    ) -> EvalOutcome {
        EvalOutcome::Value {
            value: self.0.clone(),
            repr: self.0.to_string(),
        }
    }
}

/// Writes one stdout chunk, then returns a fixed value (spec.md §8.4 S2).
struct WritesThenReturns {
    text: &'static str,
    value: serde_json::Value,
}

impl CodeEvaluator for WritesThenReturns {
    fn evaluate(
        &self,
        _code: &str,
        _ns: &Arc<dyn NamespaceStore>,
        _tracer: &CancelTracer,
        _input: &InputShim,
        output: &OutputWriter,
    ) -> EvalOutcome {
        let _ = output.write(StreamKind::Stdout, self.text.as_bytes());
        EvalOutcome::Value {
            value: self.value.clone(),
            repr: self.value.to_string(),
        }
    }
}

/// Calls `input()` once and echoes the answer back as the result (S3).
struct CallsInput {
    prompt: &'static str,
}

impl CodeEvaluator for CallsInput {
    fn evaluate(
        &self,
        _code: &str,
        _ns: &Arc<dyn NamespaceStore>,
        _tracer: &CancelTracer,
        input: &InputShim,
        _output: &OutputWriter,
    ) -> EvalOutcome {
        match input.request(self.prompt, None) {
            Ok(data) => EvalOutcome::Value {
                value: serde_json::Value::String(data.clone()),
                repr: format!("'{data}'"),
            },
            Err(e) => EvalOutcome::Exception {
                exception_type: "InputError".into(),
                message: e.to_string(),
                traceback: None,
            },
        }
    }
}

/// Spins until cancelled (S5).
struct CancellableLoop;

impl CodeEvaluator for CancellableLoop {
    fn evaluate(
        &self,
        _code: &str,
        _ns: &Arc<dyn NamespaceStore>,
        tracer: &CancelTracer,
        _input: &InputShim,
        _output: &OutputWriter,
    ) -> EvalOutcome {
        let mut ticks: u64 = 0;
        loop {
            ticks += 1;
            if tracer.should_interrupt(ticks) {
                return EvalOutcome::Exception {
                    exception_type: "KeyboardInterrupt".into(),
                    message: "interrupted by cancel()".into(),
                    traceback: None,
                };
            }
            if ticks > 50_000_000 {
                return EvalOutcome::Value {
                    value: serde_json::Value::Null,
                    repr: "None".into(),
                };
            }
            std::hint::spin_loop();
        }
    }
}

fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        executor: sies_core::ExecutorConfig {
            cancel_check_interval: 1,
            ..Default::default()
        },
        heartbeat_interval: Duration::from_secs(3600),
        default_interrupt_grace: Duration::from_millis(200),
        ready_capabilities: Vec::new(),
    }
}

/// Spawns a worker in-process (a `tokio::spawn`ed task rather than a real OS
/// subprocess, the way `ProcessSpawner` would) over a fresh in-memory duplex
/// pair for every session the pool asks it to create. Mirrors
/// `ProcessSpawner`'s shape (spawn I/O, hand back a transport) with
/// `tokio::spawn` standing in for `Command::spawn`.
struct InProcessWorkerSpawner<F> {
    make_evaluator: F,
    spawned: std::sync::Mutex<Vec<Transport<WriteHalf<DuplexStream>>>>,
}

impl<F> InProcessWorkerSpawner<F>
where
    F: Fn() -> Arc<dyn CodeEvaluator> + Send + Sync,
{
    fn new(make_evaluator: F) -> Self {
        Self {
            make_evaluator,
            spawned: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Force-closes the most recently spawned worker's transport to
    /// simulate a crashed subprocess (S6): the worker's next `recv`/`send`
    /// observes `Poisoned`/`Eof` just as it would if the OS process had
    /// died out from under it, and the writer half shutting down carries
    /// that failure over to the controller's own read loop.
    async fn crash_latest(&self) {
        let transport = self.spawned.lock().unwrap().pop();
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}

#[async_trait]
impl<F> SessionSpawner<WriteHalf<DuplexStream>> for InProcessWorkerSpawner<F>
where
    F: Fn() -> Arc<dyn CodeEvaluator> + Send + Sync,
{
    async fn spawn(&self) -> Result<(Transport<WriteHalf<DuplexStream>>, Option<Child>), SessionError> {
        let (controller, worker) = duplex(64 * 1024);
        let (controller_r, controller_w) = split(controller);
        let (worker_r, worker_w) = split(worker);

        let controller_transport = Transport::open(controller_r, controller_w, TransportConfig::default());
        let worker_transport = Transport::open(worker_r, worker_w, TransportConfig::default());
        self.spawned.lock().unwrap().push(worker_transport.clone());

        let evaluator = (self.make_evaluator)();
        let namespace: Arc<dyn NamespaceStore> = Arc::new(InMemoryNamespace::new());
        let worker = Worker::new(worker_transport, namespace, evaluator, test_worker_config());
        tokio::spawn(async move {
            let _ = worker.run().await;
        });

        Ok((controller_transport, None))
    }
}

async fn started_session<F>(make_evaluator: F) -> Session<WriteHalf<DuplexStream>>
where
    F: Fn() -> Arc<dyn CodeEvaluator> + Send + Sync + 'static,
{
    let spawner = Arc::new(InProcessWorkerSpawner::new(make_evaluator));
    let session = Session::new(SessionId::new(), spawner, SessionConfig::default());
    session.start().await.expect("worker should announce ready promptly");
    session
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_simple_expression_yields_a_result_with_no_prior_output() {
    use futures::StreamExt;

    let session = started_session(|| Arc::new(ConstantEvaluator(serde_json::json!(4))) as Arc<dyn CodeEvaluator>).await;

    let mut stream = session.execute("2 + 2", None, None).await.unwrap();
    let msg = stream.next().await.unwrap();
    match msg.body {
        MessageBody::Result { value, .. } => assert_eq!(value, serde_json::json!(4)),
        other => panic!("expected Result, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_output_arrives_before_the_result_that_follows_it() {
    use futures::StreamExt;

    let session = started_session(|| {
        Arc::new(WritesThenReturns {
            text: "hi\n",
            value: serde_json::json!(7),
        }) as Arc<dyn CodeEvaluator>
    })
    .await;

    let mut stream = session.execute("print('hi'); 7", None, None).await.unwrap();

    let output_msg = stream.next().await.unwrap();
    match &output_msg.body {
        MessageBody::Output { stream, data, .. } => {
            assert_eq!(*stream, StreamKind::Stdout);
            assert_eq!(data, "hi\n");
        }
        other => panic!("expected Output, got {other:?}"),
    }

    let result_msg = stream.next().await.unwrap();
    match result_msg.body {
        MessageBody::Result { value, .. } => assert_eq!(value, serde_json::json!(7)),
        other => panic!("expected Result, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_interactive_input_round_trips_through_a_real_worker() {
    use futures::StreamExt;

    let session = started_session(|| Arc::new(CallsInput { prompt: "name?" }) as Arc<dyn CodeEvaluator>).await;

    let mut stream = session.execute("input('name?')", None, None).await.unwrap();

    let prompt_msg = stream.next().await.unwrap();
    match &prompt_msg.body {
        MessageBody::Input { prompt, .. } => assert_eq!(prompt, "name?"),
        other => panic!("expected Input, got {other:?}"),
    };
    let input_id = prompt_msg.id;

    session.input_response(input_id, "ada").await.unwrap();

    let result_msg = stream.next().await.unwrap();
    match result_msg.body {
        MessageBody::Result { value, .. } => assert_eq!(value, serde_json::json!("ada")),
        other => panic!("expected Result, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_busy_rejection_then_cancel_frees_the_session() {
    use futures::StreamExt;

    let session = started_session(|| Arc::new(CancellableLoop) as Arc<dyn CodeEvaluator>).await;

    let first = session.execute("while True: pass", None, None).await.unwrap();
    let err = session.execute("1", None, None).await.unwrap_err();
    assert!(matches!(err, SessionError::Busy));

    // Dropping the stream before its terminal message sends a cancel
    // (spec.md §6.3); the session should fall back to Idle once the
    // worker's cancelled-execution terminal arrives.
    drop(first);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if session.state() == SessionState::Idle {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "session never returned to Idle after cancel");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut second = session.execute("2", None, None).await;
    // A fresh evaluator instance is still the CancellableLoop for this test
    // worker, so just confirm the session accepted the new execute rather
    // than rejecting it as busy.
    assert!(second.is_ok());
    if let Ok(stream) = &mut second {
        drop(stream);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_worker_crash_terminates_the_session_with_transport_closed() {
    use futures::StreamExt;

    let spawner = Arc::new(InProcessWorkerSpawner::new(|| Arc::new(CancellableLoop) as Arc<dyn CodeEvaluator>));
    let session = Session::new(SessionId::new(), Arc::clone(&spawner) as Arc<dyn SessionSpawner<_>>, SessionConfig::default());
    session.start().await.unwrap();

    let mut stream = session.execute("while True: pass", None, None).await.unwrap();
    spawner.crash_latest().await;

    let msg = stream.next().await.unwrap();
    match msg.body {
        MessageBody::Error { kind, .. } => assert_eq!(kind, Some(ErrorKind::TransportClosed)),
        other => panic!("expected transport-closed error, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Terminated);
}

/// A `SessionFactory` that always produces a fresh `Session` wired to a
/// crashable in-process worker, used to exercise pool-level recovery after
/// S6's crash (spec.md §4.9 `release`/health-check sweep).
struct CrashableFactory {
    spawner: Arc<InProcessWorkerSpawner<fn() -> Arc<dyn CodeEvaluator>>>,
}

impl CrashableFactory {
    fn new() -> Self {
        fn make_evaluator() -> Arc<dyn CodeEvaluator> {
            Arc::new(ConstantEvaluator(serde_json::json!(1)))
        }
        Self {
            spawner: Arc::new(InProcessWorkerSpawner::new(make_evaluator as fn() -> Arc<dyn CodeEvaluator>)),
        }
    }
}

#[async_trait]
impl SessionFactory<WriteHalf<DuplexStream>> for CrashableFactory {
    async fn create(&self) -> Result<Session<WriteHalf<DuplexStream>>, SessionError> {
        let session = Session::new(
            SessionId::new(),
            Arc::clone(&self.spawner) as Arc<dyn SessionSpawner<_>>,
            SessionConfig::default(),
        );
        session.start().await?;
        Ok(session)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_pool_replaces_a_session_whose_worker_crashed() {
    let factory = Arc::new(CrashableFactory::new());
    let pool = SessionPool::new(PoolConfig::default(), Arc::clone(&factory) as Arc<dyn SessionFactory<_>>);

    let session = pool.acquire(Duration::from_secs(2)).await.unwrap();
    let first_id = session.id();

    // Crash the worker backing this session, then give the receive loop a
    // moment to observe the transport failure and flip to Terminated.
    factory.spawner.crash_latest().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Terminated);

    // Returning a dead session drops it from the pool rather than
    // recycling it into `idle` (spec.md §4.9 `release`).
    pool.release(session).await;
    assert_eq!(pool.metrics().all, 0);

    // Acquiring again must produce a brand-new, healthy session rather than
    // reusing the crashed one.
    let replacement = pool.acquire(Duration::from_secs(2)).await.unwrap();
    assert_ne!(replacement.id(), first_id);
    assert!(replacement.is_alive().await);
    pool.release(replacement).await;
}
