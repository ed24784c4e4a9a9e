//! The cancel tracer contract (spec §4.4.2-§4.4.3): a token the executor
//! checks cooperatively, paired with a trace-cadence counter that models
//! the "every-N-instructions" check without assuming a concrete evaluator.
//!
//! Grounded on `ahma_mcp`'s `CancellationToken` usage in
//! `operation_monitor.rs`, generalized with an explicit check cadence since
//! this tracer fires from inside evaluator frames rather than from a tokio
//! task.

use tokio_util::sync::CancellationToken;

/// Default cadence, in evaluator "line events", between tracer checks
/// (spec §6.2 `cancel_check_interval`).
pub const DEFAULT_CHECK_INTERVAL: u64 = 100;

/// A cooperative cancellation handle installed for the duration of one
/// execution. `CodeEvaluator` implementations call `tick()` at their own
/// notion of a line event; `CancelTracer` decides, at the configured
/// cadence, whether to report the token as tripped.
///
/// The tracer itself does not interrupt anything — it only answers "should
/// I raise now?" so it stays usable by evaluators that have no notion of
/// Rust's `CancellationToken` beyond polling a boolean.
#[derive(Debug, Clone)]
pub struct CancelTracer {
    token: CancellationToken,
    check_interval: u64,
}

impl CancelTracer {
    pub fn new(check_interval: u64) -> Self {
        Self {
            token: CancellationToken::new(),
            check_interval: check_interval.max(1),
        }
    }

    /// A fresh, unlinked token — used by the executor's `prepare` step to
    /// reset cancellation state between executions (spec §4.4 step 1:
    /// "reset cancel token").
    pub fn reset(&mut self) {
        self.token = CancellationToken::new();
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_interval(&self) -> u64 {
        self.check_interval
    }

    /// Called by the evaluator at every `check_interval`-th line event.
    /// Returns `true` exactly when the evaluator should raise an interrupt
    /// in its own frame (spec §4.4.2: "raises an interrupt inside the
    /// evaluator's frame when set").
    pub fn should_interrupt(&self, line_event_count: u64) -> bool {
        line_event_count % self.check_interval == 0 && self.token.is_cancelled()
    }

    /// Await cancellation without polling, for callers (e.g. the `input()`
    /// shim) that can suspend on it directly rather than ticking a counter.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for CancelTracer {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_interrupt_only_on_cadence_and_after_cancel() {
        let tracer = CancelTracer::new(100);
        assert!(!tracer.should_interrupt(100));
        tracer.cancel();
        assert!(!tracer.should_interrupt(50));
        assert!(tracer.should_interrupt(100));
        assert!(tracer.should_interrupt(200));
    }

    #[test]
    fn reset_clears_a_prior_cancellation() {
        let mut tracer = CancelTracer::new(1);
        tracer.cancel();
        assert!(tracer.is_cancelled());
        tracer.reset();
        assert!(!tracer.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_after_cancel() {
        let tracer = CancelTracer::default();
        let waiter = tracer.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tracer.cancel();
        handle.await.unwrap();
    }
}
