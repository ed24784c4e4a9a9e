//! A generic, thread-safe state machine wrapper.
//!
//! Sessions (spec §3.2) and executions move through a small fixed set of
//! states under concurrent access from the receive loop, the pump, and
//! external callers. Rather than re-deriving a mutex-guarded transition
//! dance for each of those, every stateful component here wraps its state
//! enum in one `StateMachine<S>`.

use std::sync::{Mutex, MutexGuard};

/// Wraps a state `S` behind a mutex and offers atomic `transition`s.
///
/// # Example
///
/// ```
/// use sies_common::StateMachine;
///
/// #[derive(Debug, PartialEq)]
/// enum State {
///     Idle,
///     Running,
/// }
///
/// let machine = StateMachine::new(State::Idle);
/// let action = machine.transition(|state| match state {
///     State::Idle => {
///         *state = State::Running;
///         "started"
///     }
///     State::Running => "already running",
/// });
/// assert_eq!(action, "started");
/// ```
#[derive(Debug)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Direct access for simple reads. Prefer `transition` for anything that
    /// decides an action based on the current state.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` with exclusive access to the state, returning whatever `f`
    /// returns. The lock is held for the duration of the closure, so `f`
    /// must not block or await.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

impl<S: Clone> StateMachine<S> {
    /// Snapshot the current state.
    pub fn get(&self) -> S {
        self.lock().clone()
    }
}
