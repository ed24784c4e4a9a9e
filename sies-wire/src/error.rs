//! Codec- and transport-level failures (spec §4.1, §4.2).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    /// A read stopped partway through a frame (after the length prefix or
    /// partway through the payload), rather than cleanly at a frame
    /// boundary. Spec §4.1: "Any short read mid-frame surfaces as
    /// `Fail{TruncatedFrame}`."
    #[error("frame truncated mid-read")]
    TruncatedFrame,

    /// The declared payload length exceeds the configured maximum. The
    /// payload bytes are never read in this case (spec §4.1: "exceeding it
    /// fails ... without consuming further bytes").
    #[error("frame of {declared} bytes exceeds max_frame_size of {max}")]
    FrameTooLarge { declared: u32, max: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload used an encoding marker the codec does not recognize: {0:#x}")]
    UnknownEncodingMarker(u8),

    #[error("binary payload too short to contain its fixed header")]
    ShortBinaryHeader,
}
