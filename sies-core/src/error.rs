//! Error types for the runtime substrate. Each fallible public operation
//! returns one of these instead of `anyhow::Error` — `anyhow` is reserved
//! for the `sies-cli` binary's `main`.

use sies_wire::CodecError;
use thiserror::Error;

/// Failures from a `Transport` (spec §4.2 "Failure model": all failures are
/// terminal for the transport; no reconnection at this layer).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport closed cleanly at a frame boundary")]
    Eof,

    #[error("transport is poisoned by a prior failure")]
    Poisoned,
}

/// Failures the output pump can report back to its caller under the
/// `error` backpressure policy (spec §4.3).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PumpError {
    #[error("output queue is at capacity and backpressure policy is `error`")]
    BackpressureExceeded,

    #[error("pump task has stopped; item was not enqueued")]
    Dropped,
}

/// Failures surfaced while driving one execution end to end (spec §4.4).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("drain fence did not confirm within the configured timeout")]
    DrainTimeout,

    #[error("transport closed mid-execution")]
    TransportClosed(#[from] TransportError),
}

/// Outcome of a pending `input()` wait (spec §4.4.1).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InputWaitError {
    #[error("input() call exceeded its timeout")]
    TimedOut,

    #[error("cancellation propagated to the pending input() call")]
    Cancelled,

    #[error("executor was torn down while input() was pending")]
    ShutdownDuringInput,
}
