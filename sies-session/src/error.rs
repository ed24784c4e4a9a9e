//! Error types for the controller-side session, bridge, and pool (spec.md
//! §4.6, §4.8, §4.9). `anyhow` is reserved for the `sies-cli` binary's
//! `main`; every fallible operation here returns one of these instead.

use sies_core::TransportError;
use thiserror::Error;

/// Failures from the `Session` controller (spec.md §6.3).
#[derive(Debug, Error)]
pub enum SessionError {
    /// A second `execute` arrived while one was already in flight (spec.md
    /// §3.2 invariant: "does not mutate state").
    #[error("session already has an execution in flight")]
    Busy,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("worker did not send `ready` within {0:?}")]
    ReadyTimeout(std::time::Duration),

    #[error("failed to spawn worker subprocess: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("session is terminated")]
    Terminated,

    #[error("session was asked to {0} while not in a state that allows it")]
    InvalidState(&'static str),
}

/// Failures from the promise/correlation bridge (spec.md §4.8).
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("promise {promise_id} timed out after {elapsed_ms}ms (deadline {deadline_ms}ms)")]
    Timeout {
        promise_id: String,
        elapsed_ms: u64,
        deadline_ms: u64,
    },

    #[error("bridge is shutting down: {reason}")]
    Shutdown { reason: String },
}

/// Failures from the session pool (spec.md §4.9).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("circuit breaker is open after repeated creation failures; retry after the cooldown")]
    CreateBackoff,

    #[error("acquire() deadline exceeded while waiting for a session")]
    AcquireTimeout,

    #[error(transparent)]
    Session(#[from] SessionError),
}
