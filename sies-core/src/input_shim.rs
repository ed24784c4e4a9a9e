//! The protocol-aware `input()` shim (spec §4.4.1).
//!
//! User code running inside the evaluator thread calls `InputShim::request`
//! synchronously, the same way `ahma_core`'s `PrewarmedShell` blocks its
//! caller on a response line rather than exposing raw async machinery to a
//! synchronous caller. The shim writes the prompt through the pump as a
//! flushed `stdout` chunk, sends an `input` message, then blocks the calling
//! (dedicated evaluator) thread on a `oneshot` via the ambient tokio runtime
//! handle until a response, a timeout, a cancellation, or a teardown
//! resolves it.

use crate::error::InputWaitError;
use crate::pump::PumpHandle;
use crate::sink::OutputSink;
use sies_common::MessageId;
use sies_wire::{Message, MessageBody, StreamKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

type Outcome = Result<String, InputWaitError>;

/// Registers one waiter per outstanding `input()` call (spec §3.3: "pending
/// input waiters keyed by input-request ID"). A fresh shim is installed per
/// execution and torn down with the executor (spec §4.4 step 7).
pub struct InputShim {
    execution_id: MessageId,
    pump: Arc<PumpHandle>,
    sink: Arc<dyn OutputSink>,
    default_timeout: Duration,
    waiters: Mutex<HashMap<MessageId, oneshot::Sender<Outcome>>>,
}

impl InputShim {
    pub fn new(execution_id: MessageId, pump: Arc<PumpHandle>, sink: Arc<dyn OutputSink>, default_timeout: Duration) -> Self {
        Self {
            execution_id,
            pump,
            sink,
            default_timeout,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Blocking entry point called from the evaluator thread when user code
    /// invokes `input(prompt)`. Must be called from a context where a tokio
    /// `Handle` is reachable (the dedicated evaluator thread is spawned via
    /// `spawn_blocking`, which keeps the handle available).
    pub fn request(&self, prompt: &str, timeout_override: Option<Duration>) -> Outcome {
        let input_id = MessageId::new();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).insert(input_id, tx);

        let timeout = timeout_override.unwrap_or(self.default_timeout);
        let handle = Handle::current();
        let outcome = handle.block_on(self.send_prompt_and_wait(input_id, prompt, rx, timeout));

        if matches!(outcome, Err(InputWaitError::TimedOut)) {
            self.waiters.lock().unwrap_or_else(|e| e.into_inner()).remove(&input_id);
        }
        outcome
    }

    async fn send_prompt_and_wait(
        &self,
        input_id: MessageId,
        prompt: &str,
        rx: oneshot::Receiver<Outcome>,
        timeout: Duration,
    ) -> Outcome {
        // Spec §4.4.1: "Write the prompt (as a stdout chunk, flushed) to the
        // pump." The Open Question in spec §9 ("does the prompt flush
        // follow the pump's global backpressure policy?") is resolved in
        // DESIGN.md as yes: `push_output`/`drain` use the pump's configured
        // policy like any other chunk, so failures here are not specially
        // escalated — the `input` message is still attempted below.
        let _ = self.pump.push_output(StreamKind::Stdout, prompt.as_bytes()).await;
        let _ = self.pump.drain(self.default_timeout).await;

        let msg = Message::with_id(
            input_id,
            MessageBody::Input {
                execution_id: self.execution_id,
                prompt: prompt.to_string(),
                timeout_ms: Some(timeout.as_millis() as u64),
            },
        );
        if self.sink.send(&msg).await.is_err() {
            self.waiters.lock().unwrap_or_else(|e| e.into_inner()).remove(&input_id);
            return Err(InputWaitError::ShutdownDuringInput);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(InputWaitError::ShutdownDuringInput),
            Err(_) => Err(InputWaitError::TimedOut),
        }
    }

    /// Routes an `input_response` to its waiter (spec §4.5 worker dispatch:
    /// "route by `input_id` to the active executor's waiter"). Returns
    /// `false` if there was no such waiter — an orphan response, dropped
    /// with a counter by the caller (spec §8.1 invariant 5).
    pub fn resolve(&self, input_id: MessageId, data: String) -> bool {
        let sender = self.waiters.lock().unwrap_or_else(|e| e.into_inner()).remove(&input_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(Ok(data));
                true
            }
            None => false,
        }
    }

    /// Completes every pending waiter with `Cancelled` (spec §4.4.3).
    pub fn cancel_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap_or_else(|e| e.into_inner()));
        for (_, tx) in waiters {
            let _ = tx.send(Err(InputWaitError::Cancelled));
        }
    }

    /// Completes every pending waiter with `ShutdownDuringInput` (spec §4.4
    /// step 7 teardown).
    pub fn shutdown_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap_or_else(|e| e.into_inner()));
        for (_, tx) in waiters {
            let _ = tx.send(Err(InputWaitError::ShutdownDuringInput));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::pump::PumpConfig;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        received: StdMutex<Vec<Message>>,
    }

    #[async_trait::async_trait]
    impl OutputSink for RecordingSink {
        async fn send(&self, msg: &Message) -> Result<(), TransportError> {
            self.received.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    fn shim() -> (Arc<InputShim>, Arc<RecordingSink>) {
        let execution_id = MessageId::new();
        let sink = Arc::new(RecordingSink {
            received: StdMutex::new(Vec::new()),
        });
        let pump = Arc::new(crate::pump::spawn(execution_id, sink.clone(), PumpConfig::default()));
        let shim = Arc::new(InputShim::new(execution_id, pump, sink.clone(), Duration::from_millis(200)));
        (shim, sink)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_unblocks_a_pending_request() {
        let (shim, sink) = shim();
        let shim_for_thread = Arc::clone(&shim);
        let handle = tokio::task::spawn_blocking(move || shim_for_thread.request("? ", None));

        // Wait until the `input` message has actually been sent, then resolve it.
        let input_id = loop {
            let received = sink.received.lock().unwrap();
            if let Some(msg) = received.iter().find(|m| matches!(m.body, MessageBody::Input { .. })) {
                break msg.id;
            }
            drop(received);
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(shim.resolve(input_id, "hello".into()));

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap(), "hello");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolved_request_times_out() {
        let (shim, _sink) = shim();
        let result = tokio::task::spawn_blocking(move || shim.request("? ", Some(Duration::from_millis(20))))
            .await
            .unwrap();
        assert_eq!(result.unwrap_err(), InputWaitError::TimedOut);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_all_resolves_pending_with_cancelled() {
        let (shim, sink) = shim();
        let shim_for_thread = Arc::clone(&shim);
        let handle = tokio::task::spawn_blocking(move || shim_for_thread.request("? ", Some(Duration::from_secs(5))));

        loop {
            if sink.received.lock().unwrap().iter().any(|m| matches!(m.body, MessageBody::Input { .. })) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shim.cancel_all();

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err(), InputWaitError::Cancelled);
    }

    #[tokio::test]
    async fn orphan_resolve_returns_false() {
        let execution_id = MessageId::new();
        let sink = Arc::new(RecordingSink {
            received: StdMutex::new(Vec::new()),
        });
        let pump = Arc::new(crate::pump::spawn(execution_id, sink.clone(), PumpConfig::default()));
        let shim = InputShim::new(execution_id, pump, sink, Duration::from_millis(50));
        assert!(!shim.resolve(MessageId::new(), "orphan".into()));
    }
}
