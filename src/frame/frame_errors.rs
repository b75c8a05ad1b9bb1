//! Errors reported by the frame and message layers.

use thiserror::Error;

use super::TryFromPrimitiveError;

/// An error at the level of a whole frame: header validation, body
/// transfer, compression envelope.
///
/// Every variant except [`FrameError::BodyParse`] is fatal to the
/// connection that produced it.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The version byte's direction bit marked the frame as client-sent.
    #[error("received a frame marked as coming from a client")]
    FrameFromClient,
    /// The version byte's low bits name a protocol version other than 4.
    #[error("received a frame of protocol version {0}, only version 4 is supported")]
    VersionNotSupported(u8),
    /// The declared body length exceeds the configured frame-size limit.
    #[error("frame body of {length} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge { length: usize, limit: usize },
    /// The opcode byte is not a known response opcode.
    #[error("unknown response opcode: {0}")]
    UnknownResponseOpcode(#[from] num_enum::TryFromPrimitiveError<crate::frame::response::ResponseOpcode>),
    /// Transport ended before the declared body was fully read.
    #[error("connection closed mid-body: {missing} of {needed} bytes not received")]
    ConnectionClosed { missing: usize, needed: usize },
    /// The compression flag was set but no algorithm was negotiated.
    #[error("frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    /// Snappy produced an error while compressing.
    #[error("snappy compression failed")]
    SnappyCompression,
    /// Snappy produced an error while decompressing.
    #[error("snappy decompression failed")]
    SnappyDecompression,
    /// LZ4 block compression failed.
    #[error("lz4 compression failed: {0}")]
    Lz4Compression(#[from] lz4_flex::block::CompressError),
    /// LZ4 block decompression failed (wrong length prefix included).
    #[error("lz4 decompression failed: {0}")]
    Lz4Decompression(#[from] lz4_flex::block::DecompressError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The request body could not be serialized.
    #[error(transparent)]
    RequestSerialization(#[from] crate::frame::request::RequestSerializationError),
    /// The (decompressed) body could not be decoded.
    #[error(transparent)]
    BodyParse(#[from] ParseError),
}

/// An error while decoding a message body.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("low-level deserialization failed: {0}")]
    LowLevel(#[from] LowLevelDeserializationError),
    /// A type id or result kind the decoder does not know.
    #[error("unknown result kind: {0:#06x}")]
    UnknownResultKind(i32),
    #[error("column type id {0:#06x} is not a known type")]
    UnknownColumnType(u16),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("unknown change type in event: {0}")]
    UnknownChangeType(String),
    #[error("unknown schema change target: {0}")]
    UnknownChangeTarget(String),
    /// A cell's payload disagrees with its column type.
    #[error("malformed {type_name} cell: {reason}")]
    MalformedCell {
        type_name: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An error raised by the primitive codec in `frame::types`.
#[derive(Error, Debug)]
pub enum LowLevelDeserializationError {
    #[error("cursor underflow: needed {expected} more bytes, {available} available")]
    TooFewBytes { expected: usize, available: usize },
    #[error("length prefix is negative where that is forbidden: {0}")]
    NegativeLength(i32),
    #[error("invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("inet address length must be 4 or 16, got {0}")]
    InvalidInetLength(u8),
    #[error("string is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    IntConversion(#[from] std::num::TryFromIntError),
}
