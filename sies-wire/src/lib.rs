//! Wire protocol: the tagged message schema and the length-prefixed frame
//! codec that carries it (spec §3.1, §4.1, §6.1).

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode_frame, decode_payload, encode_frame, encode_payload, DecodeOutcome, Encoding, DEFAULT_MAX_FRAME_SIZE};
pub use error::CodecError;
pub use message::{ErrorKind, Message, MessageBody, RestoreMode, StreamKind, TransactionPolicy};
