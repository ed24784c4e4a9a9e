//! The tagged message schema (spec §3.1).
//!
//! Every message is a stable `id` + `timestamp` envelope around a tagged
//! `MessageBody`. Variant field names are chosen to match spec §3.1's table
//! exactly so the wire stays a faithful transcription of the contract.

use serde::{Deserialize, Serialize};
use sies_common::MessageId;
use std::time::SystemTime;

/// Which stream an `output` chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// How a completed execution's namespace writes are treated (spec §3.1
/// `execute.transaction_policy`, left open by the source spec — resolved in
/// DESIGN.md: `Commit` persists namespace updates regardless of outcome,
/// `DiscardOnError` asks the worker to roll the namespace back to its
/// pre-execution snapshot if the execution ends in `error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPolicy {
    Commit,
    DiscardOnError,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self::Commit
    }
}

/// `restore` merge semantics (spec §4.7 / §9 Open Question — both modes are
/// exposed rather than guessing a single one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    Merge,
    ClearThenMerge,
}

/// The stable `exception_type`/`kind` tags for semantic error classes the
/// core itself introduces (spec §6.4). A plain user exception carries
/// `kind: None` and an arbitrary `exception_type` from the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Busy,
    OutputDrainTimeout,
    ShutdownDuringInput,
    Cancelled,
    InputTimedOut,
    TransportClosed,
}

impl ErrorKind {
    /// The `exception_type` string this kind is reported under on the wire.
    pub fn exception_type(&self) -> &'static str {
        match self {
            ErrorKind::Busy => "Busy",
            ErrorKind::OutputDrainTimeout => "OutputDrainTimeout",
            ErrorKind::ShutdownDuringInput => "ShutdownDuringInput",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::InputTimedOut => "InputTimedOut",
            ErrorKind::TransportClosed => "TransportClosed",
        }
    }
}

/// The tagged union of protocol messages, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Execute {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capture_source: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_policy: Option<TransactionPolicy>,
    },
    Output {
        execution_id: MessageId,
        stream: StreamKind,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flush: Option<bool>,
    },
    Input {
        execution_id: MessageId,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    InputResponse {
        input_id: MessageId,
        data: String,
    },
    Result {
        execution_id: MessageId,
        value: serde_json::Value,
        repr: String,
        execution_time_ms: u64,
    },
    Error {
        execution_id: MessageId,
        exception_type: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },
    Cancel {
        execution_id: MessageId,
        grace_ms: u64,
    },
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        force_restart: Option<bool>,
    },
    Checkpoint {
        checkpoint_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_count: Option<u64>,
    },
    Restore {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<RestoreMode>,
    },
    Ready {
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Heartbeat {
        memory_bytes: u64,
        cpu_percent: f64,
        namespace_size: u64,
    },
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drain: Option<bool>,
    },
}

impl MessageBody {
    /// The stable tag string, matching spec §3.1's `Tag` column.
    pub fn tag(&self) -> &'static str {
        match self {
            MessageBody::Execute { .. } => "execute",
            MessageBody::Output { .. } => "output",
            MessageBody::Input { .. } => "input",
            MessageBody::InputResponse { .. } => "input_response",
            MessageBody::Result { .. } => "result",
            MessageBody::Error { .. } => "error",
            MessageBody::Cancel { .. } => "cancel",
            MessageBody::Interrupt { .. } => "interrupt",
            MessageBody::Checkpoint { .. } => "checkpoint",
            MessageBody::Restore { .. } => "restore",
            MessageBody::Ready { .. } => "ready",
            MessageBody::Heartbeat { .. } => "heartbeat",
            MessageBody::Shutdown { .. } => "shutdown",
        }
    }

    /// `true` for `result`/`error`, the two terminal message types (spec
    /// §3.1 invariant: "exactly one of `result` or `error`, never both").
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageBody::Result { .. } | MessageBody::Error { .. })
    }
}

/// A complete, stamped protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(with = "sies_common::time")]
    pub timestamp: SystemTime,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Wrap a body with a fresh id and the current timestamp.
    pub fn new(body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: sies_common::time::now(),
            body,
        }
    }

    /// Construct a message reusing an existing id — used when a reply must
    /// be addressable by an id minted elsewhere (e.g. `output`/`result`
    /// messages all share the worker's own fresh ids, but tests sometimes
    /// need to pin one down).
    pub fn with_id(id: MessageId, body: MessageBody) -> Self {
        Self {
            id,
            timestamp: sies_common::time::now(),
            body,
        }
    }

    /// The `execution_id` this message refers to, for variants that carry
    /// one. `execute` messages are their own execution id (spec §3.1
    /// invariant: "`execution_id` equals the originating `execute.id`").
    pub fn execution_id(&self) -> Option<MessageId> {
        match &self.body {
            MessageBody::Execute { .. } => Some(self.id),
            MessageBody::Output { execution_id, .. }
            | MessageBody::Input { execution_id, .. }
            | MessageBody::Result { execution_id, .. }
            | MessageBody::Error { execution_id, .. }
            | MessageBody::Cancel { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }
}
