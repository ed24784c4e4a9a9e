//! The session pool (spec.md §4.9): a bounded set of warm sessions with
//! event-driven warmup, hybrid health-checking, and a creation circuit
//! breaker.
//!
//! Grounded in `ahma_core::shell_pool`'s `ShellPoolManager`: the idle-stack
//! admission pattern, double-checked pool-existence locking, and the
//! combined `cleanup_idle_pools` sweep all reappear here as, respectively,
//! the `idle` set, the placeholder-reservation pattern, and
//! `health_check_loop`. `ahma_core`'s background tasks are currently
//! disabled ("to avoid polling issues"); this pool needs an always-on
//! event-driven warmup loop instead, so the `Notify`-based design below
//! generalizes that on-demand-only shape rather than departing from its
//! idiom.

use crate::error::{PoolError, SessionError};
use crate::session::{Session, SessionId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::Notify;

/// Watermark configuration (spec.md §6.2 "Pool configuration").
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub max_sessions: usize,
    pub max_in_flight_creates: usize,
    pub health_check_interval: Duration,
    pub create_backoff: Duration,
    pub breaker_consecutive_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 1,
            max_sessions: 8,
            max_in_flight_creates: 2,
            health_check_interval: Duration::from_secs(30),
            create_backoff: Duration::from_secs(10),
            breaker_consecutive_failures: 5,
        }
    }
}

/// Produces and starts a brand-new [`Session`] on demand. The pool calls
/// this outside its internal lock (spec.md §4.9 "never holds its internal
/// lock across a session-creation I/O operation").
#[async_trait]
pub trait SessionFactory<W>: Send + Sync
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn create(&self) -> Result<Session<W>, SessionError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    pub all: usize,
    pub idle: usize,
    pub in_use: usize,
    pub placeholders: usize,
    pub creation_failures: u64,
}

struct State<W: AsyncWrite + Unpin + Send + 'static> {
    all: HashMap<SessionId, Session<W>>,
    idle: HashSet<SessionId>,
    in_use: HashSet<SessionId>,
    placeholders: HashSet<SessionId>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> State<W> {
    fn reserved_capacity(&self) -> usize {
        self.all.len() + self.placeholders.len()
    }
}

struct Breaker {
    consecutive_failures: AtomicU32,
    open_until: StdMutex<Option<Instant>>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            open_until: StdMutex::new(None),
        }
    }

    fn is_open(&self) -> bool {
        match *self.open_until.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, threshold: u32, cooldown: Duration) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= threshold {
            *self.open_until.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now() + cooldown);
        }
    }
}

/// Maintains a bounded set of warm [`Session`]s (spec.md §4.9).
pub struct SessionPool<W: AsyncWrite + Unpin + Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory<W>>,
    state: StdMutex<State<W>>,
    watermark_violation: Notify,
    unhealthy_event: Notify,
    breaker: Breaker,
    creation_failures: AtomicU64,
}

impl<W: AsyncWrite + Unpin + Send + 'static> SessionPool<W> {
    pub fn new(config: PoolConfig, factory: Arc<dyn SessionFactory<W>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            state: StdMutex::new(State {
                all: HashMap::new(),
                idle: HashSet::new(),
                in_use: HashSet::new(),
                placeholders: HashSet::new(),
            }),
            watermark_violation: Notify::new(),
            unhealthy_event: Notify::new(),
            breaker: Breaker::new(),
            creation_failures: AtomicU64::new(0),
        })
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        PoolMetrics {
            all: state.all.len(),
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            placeholders: state.placeholders.len(),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
        }
    }

    /// Acquires an idle, healthy session or creates a new one, subject to
    /// `max_sessions` and the circuit breaker, blocking up to `deadline`
    /// (spec.md §4.9 `acquire`).
    pub async fn acquire(self: &Arc<Self>, deadline: Duration) -> Result<Session<W>, PoolError> {
        let overall_deadline = Instant::now() + deadline;

        loop {
            if self.breaker.is_open() {
                return Err(PoolError::CreateBackoff);
            }

            // Try an idle session first, discarding any that turn out to be
            // unhealthy rather than handing them to the caller.
            loop {
                let candidate = {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    let id = state.idle.iter().next().copied();
                    match id {
                        Some(id) => {
                            state.idle.remove(&id);
                            state.all.get(&id).cloned()
                        }
                        None => break,
                    }
                };
                let Some(session) = candidate else { continue };
                if session.is_alive().await {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.in_use.insert(session.id());
                    return Ok(session);
                } else {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.all.remove(&session.id());
                }
            }

            // No usable idle session. Reserve a placeholder slot if there's
            // room, then create outside the lock.
            let reserved_id = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.reserved_capacity() < self.config.max_sessions {
                    let placeholder = SessionId::new();
                    state.placeholders.insert(placeholder);
                    Some(placeholder)
                } else {
                    None
                }
            };

            let Some(placeholder) = reserved_id else {
                // At capacity: wait for a release or health-check eviction to
                // free a slot, bounded by the caller's deadline.
                let remaining = overall_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(PoolError::AcquireTimeout);
                }
                if tokio::time::timeout(remaining, self.watermark_violation.notified())
                    .await
                    .is_err()
                {
                    return Err(PoolError::AcquireTimeout);
                }
                continue;
            };

            match self.factory.create().await {
                Ok(session) => {
                    self.breaker.record_success();
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.placeholders.remove(&placeholder);
                    state.in_use.insert(session.id());
                    state.all.insert(session.id(), session.clone());
                    return Ok(session);
                }
                Err(err) => {
                    self.creation_failures.fetch_add(1, Ordering::Relaxed);
                    self.breaker.record_failure(
                        self.config.breaker_consecutive_failures,
                        self.config.create_backoff,
                    );
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.placeholders.remove(&placeholder);
                    }
                    if Instant::now() >= overall_deadline {
                        return Err(PoolError::Session(err));
                    }
                    // loop back around; breaker may now be open.
                }
            }
        }
    }

    /// Returns `session` to `idle` if it is healthy, otherwise drops it
    /// from the pool entirely (spec.md §4.9 `release`).
    pub async fn release(self: &Arc<Self>, session: Session<W>) {
        let healthy = session.is_alive().await
            && session.state() == crate::session::SessionState::Idle;

        let should_signal_warmup = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_use.remove(&session.id());
            if healthy {
                state.idle.insert(session.id());
            } else {
                state.all.remove(&session.id());
            }
            state.idle.len() < self.config.min_idle
        };

        if should_signal_warmup {
            self.watermark_violation.notify_one();
        }
    }

    /// Creates sessions up to `min_idle` whenever signaled, never polling
    /// (spec.md §4.9 `warmup loop`). Intended to run for the pool's
    /// lifetime via `tokio::spawn(pool.clone().run_warmup_loop())`.
    pub async fn run_warmup_loop(self: Arc<Self>) {
        loop {
            self.watermark_violation.notified().await;
            loop {
                if self.breaker.is_open() {
                    break;
                }
                let should_create = {
                    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.idle.len() < self.config.min_idle
                        && state.reserved_capacity() < self.config.max_sessions
                };
                if !should_create {
                    break;
                }
                let placeholder = {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    let placeholder = SessionId::new();
                    state.placeholders.insert(placeholder);
                    placeholder
                };
                match self.factory.create().await {
                    Ok(session) => {
                        self.breaker.record_success();
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.placeholders.remove(&placeholder);
                        state.idle.insert(session.id());
                        state.all.insert(session.id(), session);
                    }
                    Err(_) => {
                        self.creation_failures.fetch_add(1, Ordering::Relaxed);
                        self.breaker.record_failure(
                            self.config.breaker_consecutive_failures,
                            self.config.create_backoff,
                        );
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.placeholders.remove(&placeholder);
                        break;
                    }
                }
            }
        }
    }

    /// Wakes on a baseline interval and on explicit unhealthy-session
    /// events, evicting dead idle sessions (spec.md §4.9 `health-check
    /// loop`).
    pub async fn run_health_check_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.unhealthy_event.notified() => {}
            }
            self.sweep_unhealthy_idle().await;
        }
    }

    /// Called by embedding code when a session it holds reports unhealthy
    /// outside of `release` (e.g. a heartbeat anomaly), to trigger an
    /// immediate sweep rather than waiting for the baseline interval.
    pub fn report_unhealthy(&self) {
        self.unhealthy_event.notify_one();
    }

    async fn sweep_unhealthy_idle(self: &Arc<Self>) {
        let idle_ids: Vec<SessionId> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.idle.iter().copied().collect()
        };
        let mut became_short = false;
        for id in idle_ids {
            let session = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.all.get(&id).cloned()
            };
            let Some(session) = session else { continue };
            if !session.is_alive().await {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.idle.remove(&id);
                state.all.remove(&id);
                became_short = state.idle.len() < self.config.min_idle;
            }
        }
        if became_short {
            self.watermark_violation.notify_one();
        }
    }
}
