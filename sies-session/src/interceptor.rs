//! The session's interceptor list (spec.md §3.2, §4.6).
//!
//! Interceptors run synchronously, in registration order, inside the
//! session's receive task — the same task that is the transport's sole
//! reader. Spec.md §9's Open Question ("quarantine slow interceptors?") is
//! resolved here as documented in `DESIGN.md`: overruns are logged, not
//! quarantined, matching `ahma_http_bridge::session`'s module, which logs
//! slow SSE broadcast sends rather than dropping subscribers.

use sies_wire::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// A non-blocking observer of every inbound message on a session.
///
/// Implementations must return promptly (spec.md §3.2: "budget ~10 ms");
/// anything heavier must hand off to a spawned task.
pub trait MessageInterceptor: Send + Sync {
    fn on_message(&self, msg: &Message);
}

/// Handle returned by [`InterceptorList::add`], passed back to
/// [`InterceptorList::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptorHandle(u64);

pub(crate) struct InterceptorList {
    entries: RwLock<Vec<(u64, Arc<dyn MessageInterceptor>)>>,
    next_id: AtomicU64,
    budget: Duration,
}

impl InterceptorList {
    pub(crate) fn new(budget: Duration) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            budget,
        }
    }

    pub(crate) fn add(&self, interceptor: Arc<dyn MessageInterceptor>) -> InterceptorHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, interceptor));
        InterceptorHandle(id)
    }

    pub(crate) fn remove(&self, handle: InterceptorHandle) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != handle.0);
    }

    /// Runs every interceptor against `msg`, in registration order, logging
    /// (but not removing) any that exceed the soft budget.
    pub(crate) fn dispatch(&self, msg: &Message) {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        for (id, interceptor) in entries.iter() {
            let started = Instant::now();
            interceptor.on_message(msg);
            let elapsed = started.elapsed();
            if elapsed > self.budget {
                tracing::warn!(
                    interceptor_id = id,
                    ?elapsed,
                    budget_ms = self.budget.as_millis() as u64,
                    message_type = msg.body.tag(),
                    "interceptor exceeded its soft time budget"
                );
            }
        }
    }
}
