//! Shared, small-surface building blocks used by every other crate in the
//! workspace: opaque message identifiers, wall-clock timestamp (de)serialization,
//! and a generic mutex-backed state machine.
//!
//! Nothing in here is specific to the execution protocol; it is the kind of
//! cross-cutting glue a workspace accumulates once more than one crate needs
//! the same small utility.

pub mod ids;
pub mod state_machine;
pub mod time;

pub use ids::MessageId;
pub use state_machine::StateMachine;
