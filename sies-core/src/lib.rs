//! The runtime substrate: transport framing, the output pump, cancellation,
//! the `input()` shim, and the per-execution engine (spec §4.2-§4.5).

pub mod cancel;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod heartbeat;
pub mod input_shim;
pub mod namespace;
pub mod pump;
pub mod sink;
pub mod transport;
pub mod worker;

pub use error::{ExecutorError, InputWaitError, PumpError, TransportError};
pub use evaluator::{CodeEvaluator, EvalOutcome};
pub use executor::{ExecutionOutcome, Executor, ExecutorConfig};
pub use heartbeat::{DefaultHeartbeatSampler, HeartbeatSample, HeartbeatSampler};
pub use namespace::{InMemoryNamespace, NamespaceStore};
pub use pump::{BackpressurePolicy, OutputWriter, PumpConfig, PumpHandle};
pub use sink::OutputSink;
pub use transport::{Transport, TransportConfig};
pub use worker::{Worker, WorkerConfig, WorkerCounters, WorkerExit};
