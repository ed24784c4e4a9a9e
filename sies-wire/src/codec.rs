//! The frame codec (spec §4.1): `uint32_be length | payload[length]`, with
//! two payload encodings negotiated once per connection and fixed for its
//! lifetime.
//!
//! The **binary** encoding externalizes the envelope's fixed-width fields
//! (`id`, `timestamp`) into raw bytes ahead of a JSON-encoded body, so a
//! reader can validate and route a message without a full JSON parse of the
//! envelope. The **JSON** encoding is the whole `Message` as one JSON
//! object, matching `ahma_http_bridge`'s line-oriented JSON wire format.
//! Both decode back to the same `Message` type; `encode ∘ decode = id`
//! holds for each independently (spec §8.2).

use crate::error::CodecError;
use crate::message::{Message, MessageBody};
use sies_common::MessageId;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Payload encoding, chosen once at connection setup (spec §4.1: "The
/// encoding is chosen at connection setup per direction and is stable for
/// the connection's lifetime").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Json,
}

/// Default cap on a single frame's payload size. Configurable per spec
/// §4.1 ("Max frame size is configurable").
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

const BINARY_MARKER: u8 = 0xB1;

/// Result of attempting to read one frame: either a decoded message, or a
/// clean end-of-stream observed exactly at a frame boundary (spec §4.1:
/// "`decode_frame(stream) -> msg | Eof` ... returns `Eof` only on clean
/// closure at a frame boundary").
#[derive(Debug)]
pub enum DecodeOutcome {
    Message(Message),
    Eof,
}

/// Encode a message's payload bytes (no length prefix) under the given
/// encoding. Total and pure: for any well-formed `Message` this always
/// succeeds (spec §4.1: "`encode(msg) -> bytes`: total pure function;
/// never partial").
pub fn encode_payload(msg: &Message, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
    match encoding {
        Encoding::Json => Ok(serde_json::to_vec(msg)?),
        Encoding::Binary => {
            let mut out = Vec::with_capacity(64);
            out.push(BINARY_MARKER);
            out.extend_from_slice(msg.id.as_uuid().as_bytes());
            out.extend_from_slice(&timestamp_millis(msg.timestamp).to_be_bytes());
            out.extend_from_slice(&serde_json::to_vec(&msg.body)?);
            Ok(out)
        }
    }
}

/// Encode a complete frame: the 4-byte big-endian length prefix followed by
/// the encoded payload.
pub fn encode_frame(msg: &Message, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
    let payload = encode_payload(msg, encoding)?;
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        declared: u32::MAX,
        max: u32::MAX,
    })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode payload bytes (without the length prefix) back into a `Message`.
pub fn decode_payload(bytes: &[u8], encoding: Encoding) -> Result<Message, CodecError> {
    match encoding {
        Encoding::Json => Ok(serde_json::from_slice(bytes)?),
        Encoding::Binary => {
            if bytes.len() < 1 + 16 + 8 {
                return Err(CodecError::ShortBinaryHeader);
            }
            let marker = bytes[0];
            if marker != BINARY_MARKER {
                return Err(CodecError::UnknownEncodingMarker(marker));
            }
            let id_bytes: [u8; 16] = bytes[1..17].try_into().expect("slice is 16 bytes");
            let id = MessageId::from_uuid(uuid::Uuid::from_bytes(id_bytes));
            let millis_bytes: [u8; 8] = bytes[17..25].try_into().expect("slice is 8 bytes");
            let timestamp = millis_to_timestamp(i64::from_be_bytes(millis_bytes));
            let body: MessageBody = serde_json::from_slice(&bytes[25..])?;
            Ok(Message {
                id,
                timestamp,
                body,
            })
        }
    }
}

/// Write one complete frame to `writer` and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
    encoding: Encoding,
) -> Result<(), CodecError> {
    let frame = encode_frame(msg, encoding)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame from `reader`.
///
/// Reads exactly one length prefix then exactly that many bytes (spec
/// §4.1). A clean close with zero bytes read at the prefix boundary yields
/// `Eof`; anything else that stops short is `TruncatedFrame`.
pub async fn decode_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
    encoding: Encoding,
) -> Result<DecodeOutcome, CodecError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0usize;
    loop {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(DecodeOutcome::Eof);
            }
            return Err(CodecError::TruncatedFrame);
        }
        filled += n;
        if filled == len_buf.len() {
            break;
        }
    }
    let declared = u32::from_be_bytes(len_buf);
    if declared > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            declared,
            max: max_frame_size,
        });
    }

    let mut payload = vec![0u8; declared as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| CodecError::TruncatedFrame)?;

    let msg = decode_payload(&payload, encoding)?;
    Ok(DecodeOutcome::Message(msg))
}

fn timestamp_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn millis_to_timestamp(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis((-millis) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StreamKind;
    use std::io::Cursor;

    fn sample_message() -> Message {
        Message::new(MessageBody::Output {
            execution_id: MessageId::new(),
            stream: StreamKind::Stdout,
            data: "hello\n".into(),
            flush: Some(true),
        })
    }

    #[test]
    fn binary_round_trips() {
        let msg = sample_message();
        let payload = encode_payload(&msg, Encoding::Binary).unwrap();
        let back = decode_payload(&payload, Encoding::Binary).unwrap();
        assert_eq!(msg.id, back.id);
        assert_eq!(msg.body.tag(), back.body.tag());
    }

    #[test]
    fn json_round_trips() {
        let msg = sample_message();
        let payload = encode_payload(&msg, Encoding::Json).unwrap();
        let back = decode_payload(&payload, Encoding::Json).unwrap();
        assert_eq!(msg.id, back.id);
        assert_eq!(msg.body.tag(), back.body.tag());
    }

    #[tokio::test]
    async fn decode_frame_reads_exactly_one_frame() {
        let msg = sample_message();
        let frame = encode_frame(&msg, Encoding::Json).unwrap();
        let mut two_frames = frame.clone();
        two_frames.extend_from_slice(&frame);
        let mut cursor = Cursor::new(two_frames);

        let first = decode_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE, Encoding::Json)
            .await
            .unwrap();
        match first {
            DecodeOutcome::Message(m) => assert_eq!(m.id, msg.id),
            DecodeOutcome::Eof => panic!("expected a message"),
        }

        let second = decode_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE, Encoding::Json)
            .await
            .unwrap();
        assert!(matches!(second, DecodeOutcome::Message(_)));
    }

    #[tokio::test]
    async fn decode_frame_reports_eof_at_boundary() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let outcome = decode_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE, Encoding::Json)
            .await
            .unwrap();
        assert!(matches!(outcome, DecodeOutcome::Eof));
    }

    #[tokio::test]
    async fn decode_frame_reports_truncated_mid_length_prefix() {
        let mut cursor = Cursor::new(vec![0u8, 0u8]);
        let err = decode_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE, Encoding::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::TruncatedFrame));
    }

    #[tokio::test]
    async fn decode_frame_reports_truncated_mid_payload() {
        let msg = sample_message();
        let frame = encode_frame(&msg, Encoding::Json).unwrap();
        let mut cursor = Cursor::new(frame[..frame.len() - 2].to_vec());
        let err = decode_frame(&mut cursor, DEFAULT_MAX_FRAME_SIZE, Encoding::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::TruncatedFrame));
    }

    #[tokio::test]
    async fn decode_frame_rejects_oversized_frame_without_consuming_payload() {
        let msg = sample_message();
        let frame = encode_frame(&msg, Encoding::Json).unwrap();
        let mut cursor = Cursor::new(frame);
        let err = decode_frame(&mut cursor, 4, Encoding::Json).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }
}
