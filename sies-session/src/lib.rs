//! The controller side of SIES (spec.md §4.6-§4.9): the `Session`
//! controller, its interceptor list, the promise/correlation bridge, and
//! the session pool.

pub mod bridge;
pub mod error;
pub mod interceptor;
pub mod pool;
pub mod process;
pub mod session;

pub use bridge::{Bridge, BridgeMetrics, Promise, RequestKind};
pub use error::{BridgeError, PoolError, SessionError};
pub use interceptor::{InterceptorHandle, MessageInterceptor};
pub use pool::{PoolConfig, PoolMetrics, SessionFactory, SessionPool};
pub use process::{ProcessSpawner, SpawnSpec};
pub use session::{
    ExecuteStream, HeartbeatSnapshot, Session, SessionConfig, SessionId, SessionInfo,
    SessionMetrics, SessionSpawner, SessionState,
};
