//! Frame layer of the CQL native protocol, version 4.
//!
//! A frame is a fixed 9-byte header followed by a body of the declared
//! length. The body may be compressed as a whole when flag bit 0 is set
//! and a compression algorithm was negotiated during the handshake.

pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;
pub mod value;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::collections::HashMap;
use std::fmt::Display;

use frame_errors::FrameError;
use request::SerializableRequest;
use response::ResponseOpcode;

const HEADER_SIZE: usize = 9;

/// Version byte of every outbound frame.
const REQUEST_VERSION: u8 = 0x04;
/// Direction bit: set on frames sent by the server.
const DIRECTION_RESPONSE: u8 = 0x80;

// Frame flags.
pub(crate) const FLAG_COMPRESSION: u8 = 0x01;
pub(crate) const FLAG_TRACING: u8 = 0x02;
pub(crate) const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub(crate) const FLAG_WARNING: u8 = 0x08;

/// Default cap on a single frame body. Breaching it is fatal.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// The body compression algorithm negotiated for a connection.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 block format, prefixed on the wire with a 4-byte big-endian
    /// uncompressed length.
    Lz4,
    /// Snappy raw block format, no length prefix.
    Snappy,
}

impl Compression {
    /// Name used in the STARTUP options map and SUPPORTED advertisement.
    pub fn as_startup_name(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_startup_name())
    }
}

/// A request frame ready to be written: header (with a stream id patched
/// in at write time) plus optionally-compressed body.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        data[0] = REQUEST_VERSION;
        data[1] = flags;
        // Bytes 2..4 are the stream id, patched in by the dispatcher.
        data[4] = R::OPCODE as u8;

        let body_len = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&body_len.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn opcode(&self) -> u8 {
        self.data[4]
    }
}

/// Header fields not implied by the frame's message type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: REQUEST_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// Reads one response frame: exactly 9 header bytes, validated, then
/// exactly `length` body bytes.
///
/// The returned body is raw; decompression and flag-driven extensions are
/// the caller's next step via [`parse_response_body_extensions`].
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    max_frame_size: usize,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & DIRECTION_RESPONSE == 0 {
        return Err(FrameError::FrameFromClient);
    }
    if version & 0x7F != REQUEST_VERSION {
        return Err(FrameError::VersionNotSupported(version & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();
    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;
    if length > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            length,
            limit: max_frame_size,
        });
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed {
                missing: raw_body.remaining_mut(),
                needed: length,
            });
        }
    }

    let params = FrameParams {
        version,
        flags,
        stream,
    };
    Ok((params, opcode, raw_body.into_inner().into()))
}

/// A response body with its flag-driven prefixes stripped off.
#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
}

/// Decompresses the body when flag bit 0 is set and strips the tracing,
/// warnings and custom-payload prefixes declared by the remaining flags.
///
/// A compression flag without a negotiated algorithm is a protocol
/// violation and fatal to the connection.
pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf).map_err(frame_errors::ParseError::from)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf).map_err(frame_errors::ParseError::from)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let len = types::read_short_length(buf).map_err(|e| {
            FrameError::BodyParse(frame_errors::ParseError::from(
                frame_errors::LowLevelDeserializationError::from(e),
            ))
        })?;
        let mut map = HashMap::with_capacity(len);
        for _ in 0..len {
            let key = types::read_string(buf)
                .map_err(frame_errors::ParseError::from)?
                .to_owned();
            let val = types::read_bytes(buf)
                .map_err(frame_errors::ParseError::from)?
                .to_vec();
            map.insert(key, val);
        }
        let consumed = body_len - buf.len();
        body.advance(consumed);
        Some(map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

pub(crate) fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            // The native protocol carries the uncompressed length as a
            // big-endian prefix; lz4_flex's own prepend helper would write
            // it little-endian.
            let uncomp_len = uncomp_body.len() as u32;
            let compressed = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + compressed.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&compressed);
            Ok(())
        }
        Compression::Snappy => {
            let old_len = out.len();
            out.resize(old_len + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let written = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_len..])
                .map_err(|_| FrameError::SnappyCompression)?;
            out.truncate(old_len + written);
            Ok(())
        }
    }
}

pub(crate) fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < 4 {
                return Err(FrameError::ConnectionClosed {
                    missing: 4 - comp_body.len(),
                    needed: 4,
                });
            }
            let uncomp_len = comp_body.get_u32() as usize;
            Ok(lz4_flex::decompress(comp_body, uncomp_len)?)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::SnappyDecompression),
    }
}

/// An error type for parsing an enum discriminant from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

impl<T: Copy + std::fmt::Debug> TryFromPrimitiveError<T> {
    pub(crate) fn new(enum_name: &'static str, primitive: T) -> Self {
        Self {
            enum_name,
            primitive,
        }
    }
}
