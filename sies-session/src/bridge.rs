//! The promise/correlation bridge (spec.md §4.8): "fire-and-await"
//! request/response correlation over a session's message stream, usable by
//! higher-level durable workflows.
//!
//! Grounded in `ahma_http_bridge::bridge`'s `DashMap<String, oneshot::Sender>`
//! pending-request map and its `tokio::time::timeout`-wrapped wait with
//! cleanup-on-timeout. Unlike `ahma_http_bridge::bridge` (which keys purely
//! by the MCP request id), correlation here has two shapes — a whole-execution promise
//! and a nested input-request promise — so the pending map is keyed by a
//! [`CorrelationKey`] while the human-readable `promise_id` string (spec.md
//! §4.8 "Determinism rules") is carried alongside for logging/inspection.

use crate::error::BridgeError;
use dashmap::DashMap;
use sies_common::MessageId;
use sies_wire::{Message, MessageBody};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// The internal lookup key. An `execute` terminal message is matched by its
/// own id (which doubles as `execution_id`, per `Message::execution_id`);
/// an `input_response` is matched by the bare `input_id` it carries, since
/// that message never repeats the owning `execution_id` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CorrelationKey {
    Execution(MessageId),
    Input(MessageId),
}

struct PendingPromise {
    tx: oneshot::Sender<Result<Message, BridgeError>>,
    timeout_task: JoinHandle<()>,
}

/// Metrics exposed by [`Bridge::metrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeMetrics {
    pub pending: usize,
    pub high_water_mark: usize,
    pub timeouts: u64,
    pub late_responses: u64,
}

/// Request kinds a caller may correlate a response to (spec.md §4.8
/// "Determinism rules").
#[derive(Debug, Clone, Copy)]
pub enum RequestKind {
    /// Correlate on the `execute.id` itself (which doubles as the
    /// resulting `execution_id`).
    Execute,
    /// Correlate on a freshly minted `input.id`, nested under the owning
    /// execution for the human-readable `promise_id` only.
    Input { execution_id: MessageId },
}

/// A pending request/response correlation, returned by [`Bridge::register`].
pub struct Promise {
    pub promise_id: String,
    rx: oneshot::Receiver<Result<Message, BridgeError>>,
}

impl Promise {
    /// Await resolution, rejection, or the bridge being torn down mid-wait.
    pub async fn wait(self) -> Result<Message, BridgeError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Shutdown {
                reason: "bridge dropped the promise without resolving it".into(),
            }),
        }
    }
}

/// Tracks in-flight request/response correlations over a session.
///
/// Always held behind an `Arc` (see [`Bridge::register`]'s `self: &Arc<Self>`
/// receiver) so the per-promise timeout task can reach back into the pending
/// map without a reference cycle.
pub struct Bridge {
    pending: DashMap<CorrelationKey, PendingPromise>,
    high_water_mark: AtomicUsize,
    timeouts: AtomicU64,
    late_responses: AtomicU64,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            high_water_mark: AtomicUsize::new(0),
            timeouts: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
        }
    }

    /// Registers a pending promise and schedules its timeout task. The
    /// caller is still responsible for sending the underlying protocol
    /// message through the session — the bridge only owns correlation, not
    /// transport access, so it stays independent of any particular
    /// `Transport<W>` type parameter.
    pub fn register(
        self: &Arc<Self>,
        kind: RequestKind,
        request_id: MessageId,
        deadline: Duration,
    ) -> Promise {
        let (key, promise_id) = match kind {
            RequestKind::Execute => (
                CorrelationKey::Execution(request_id),
                format!("exec:{request_id}"),
            ),
            RequestKind::Input { execution_id } => (
                CorrelationKey::Input(request_id),
                format!("{execution_id}:input:{request_id}"),
            ),
        };

        let (tx, rx) = oneshot::channel();
        let timeout_task = tokio::spawn(Self::run_timeout(
            Arc::clone(self),
            key,
            promise_id.clone(),
            deadline,
        ));

        self.pending.insert(key, PendingPromise { tx, timeout_task });
        self.high_water_mark
            .fetch_max(self.pending.len(), Ordering::Relaxed);

        Promise { promise_id, rx }
    }

    async fn run_timeout(self: Arc<Self>, key: CorrelationKey, promise_id: String, deadline: Duration) {
        tokio::time::sleep(deadline).await;
        if let Some((_, pending)) = self.pending.remove(&key) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            let _ = pending.tx.send(Err(BridgeError::Timeout {
                promise_id,
                elapsed_ms: deadline.as_millis() as u64,
                deadline_ms: deadline.as_millis() as u64,
            }));
        }
    }

    /// Matches `msg` against the pending map and resolves the corresponding
    /// promise (spec.md §4.8 `route_response`). Intended to be installed as
    /// a passive interceptor on the owning session; never errors since an
    /// unmatched message is simply not a response to anything registered
    /// here.
    pub fn route_response(&self, msg: &Message) {
        let key = match &msg.body {
            MessageBody::Result { execution_id, .. } | MessageBody::Error { execution_id, .. } => {
                CorrelationKey::Execution(*execution_id)
            }
            MessageBody::InputResponse { input_id, .. } => CorrelationKey::Input(*input_id),
            _ => return,
        };

        match self.pending.remove(&key) {
            Some((_, pending)) => {
                pending.timeout_task.abort();
                let _ = pending.tx.send(Ok(msg.clone()));
            }
            None => {
                self.late_responses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Rejects every pending promise with a structured shutdown reason and
    /// clears the map. Idempotent: a second call simply finds nothing
    /// pending (spec.md §8.2 "bridge.close() is idempotent").
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let keys: Vec<CorrelationKey> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                pending.timeout_task.abort();
                let _ = pending.tx.send(Err(BridgeError::Shutdown {
                    reason: reason.clone(),
                }));
            }
        }
    }

    pub fn metrics(&self) -> BridgeMetrics {
        BridgeMetrics {
            pending: self.pending.len(),
            high_water_mark: self.high_water_mark.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sies_common::MessageId as Id;

    #[tokio::test]
    async fn execute_promise_id_matches_determinism_rule() {
        let bridge = Arc::new(Bridge::new());
        let exec_id = Id::new();
        let promise = bridge.register(RequestKind::Execute, exec_id, Duration::from_secs(1));
        assert_eq!(promise.promise_id, format!("exec:{exec_id}"));
    }

    #[tokio::test]
    async fn input_promise_id_matches_determinism_rule() {
        let bridge = Arc::new(Bridge::new());
        let exec_id = Id::new();
        let input_id = Id::new();
        let promise = bridge.register(
            RequestKind::Input {
                execution_id: exec_id,
            },
            input_id,
            Duration::from_secs(1),
        );
        assert_eq!(promise.promise_id, format!("{exec_id}:input:{input_id}"));
    }

    #[tokio::test]
    async fn route_response_resolves_the_matching_promise() {
        let bridge = Arc::new(Bridge::new());
        let exec_id = Id::new();
        let promise = bridge.register(RequestKind::Execute, exec_id, Duration::from_secs(5));

        let result_msg = Message::new(MessageBody::Result {
            execution_id: exec_id,
            value: serde_json::Value::Null,
            repr: "None".into(),
            execution_time_ms: 1,
        });
        bridge.route_response(&result_msg);

        let resolved = promise.wait().await.unwrap();
        assert!(matches!(resolved.body, MessageBody::Result { .. }));
        assert_eq!(bridge.metrics().pending, 0);
    }

    #[tokio::test]
    async fn unmatched_response_is_counted_as_late() {
        let bridge = Arc::new(Bridge::new());
        let result_msg = Message::new(MessageBody::Result {
            execution_id: Id::new(),
            value: serde_json::Value::Null,
            repr: "None".into(),
            execution_time_ms: 1,
        });
        bridge.route_response(&result_msg);
        assert_eq!(bridge.metrics().late_responses, 1);
    }

    #[tokio::test]
    async fn close_rejects_all_pending_and_is_idempotent() {
        let bridge = Arc::new(Bridge::new());
        let promise = bridge.register(RequestKind::Execute, Id::new(), Duration::from_secs(5));
        bridge.close("shutting down");
        bridge.close("shutting down again");
        let err = promise.wait().await.unwrap_err();
        assert!(matches!(err, BridgeError::Shutdown { .. }));
        assert_eq!(bridge.metrics().pending, 0);
    }

    #[tokio::test]
    async fn high_water_mark_tracks_peak_pending_count() {
        let bridge = Arc::new(Bridge::new());
        let _p1 = bridge.register(RequestKind::Execute, Id::new(), Duration::from_secs(5));
        let _p2 = bridge.register(RequestKind::Execute, Id::new(), Duration::from_secs(5));
        bridge.close("done");
        assert_eq!(bridge.metrics().high_water_mark, 2);
    }

    #[tokio::test]
    async fn unresolved_promise_times_out_and_is_removed() {
        let bridge = Arc::new(Bridge::new());
        let exec_id = Id::new();
        let promise = bridge.register(RequestKind::Execute, exec_id, Duration::from_millis(20));

        let err = promise.wait().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
        assert_eq!(bridge.metrics().pending, 0);
        assert_eq!(bridge.metrics().timeouts, 1);
    }
}
