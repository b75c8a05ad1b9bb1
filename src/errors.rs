//! The error surface of the engine.
//!
//! [`RequestError`] variants are named by failure kind. The first four
//! kinds are fatal to their connection: the dispatcher enters its closed
//! state and every outstanding waiter is completed with the same kind.
//! `ServerError`, `BadParameter` and `Unsupported` surface only to the
//! originating caller.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::frame::frame_errors::{FrameError, ParseError};
use crate::frame::request::RequestSerializationError;
use crate::frame::response::error::DbError;
use crate::frame::response::ResponseOpcode;
use crate::serialize::BindError;

/// An error completing a single request.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestError {
    /// Malformed bytes came in on the connection. Fatal.
    #[error("malformed data on the connection: {0}")]
    BadData(#[source] BrokenConnectionError),

    /// The peer broke a protocol rule (bad version byte, unknown opcode,
    /// response on an unknown stream, compression without negotiation).
    /// Fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[source] BrokenConnectionError),

    /// The transport ended or the connection was closed. Fatal; every
    /// outstanding waiter receives this kind exactly once.
    #[error("connection closed: {0}")]
    ConnectionClosed(#[source] BrokenConnectionError),

    /// The handshake did not reach the ready state in time. Fatal.
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    /// A well-formed ERROR response. Not fatal; the connection stays
    /// usable.
    #[error("server error {code:#06x}: {reason}", code = .0.code(), reason = .1)]
    ServerError(DbError, String),

    /// Caller-side binding mismatch, detected before any I/O.
    #[error("bad parameter: {0}")]
    BadParameter(#[from] BadParameterError),

    /// The caller asked for a feature this engine does not implement.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A response of a kind the request cannot produce (e.g. READY to a
    /// PREPARE). Surfaces to the originating caller only.
    #[error("unexpected {response} response to {request}")]
    UnexpectedResponse {
        request: &'static str,
        response: &'static str,
    },
}

impl RequestError {
    /// Whether this error kind closes its connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RequestError::BadData(_)
                | RequestError::ProtocolViolation(_)
                | RequestError::ConnectionClosed(_)
                | RequestError::HandshakeTimeout(_)
        )
    }
}

/// A caller-side request-construction failure. No frame was written.
#[derive(Error, Debug)]
pub enum BadParameterError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    RequestSerialization(#[from] RequestSerializationError),
}

impl From<BindError> for RequestError {
    fn from(err: BindError) -> Self {
        RequestError::BadParameter(BadParameterError::Bind(err))
    }
}

/// The cause that moved a connection into its terminal state.
///
/// Cheaply clonable: one instance is fanned out to every outstanding
/// waiter.
#[derive(Error, Debug, Clone)]
#[error("connection broken: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Reading or validating a frame failed.
    #[error("frame error: {0}")]
    Frame(FrameError),

    /// A frame body did not decode as its opcode demands.
    #[error("response body decoding failed: {0}")]
    ResponseDecode(ParseError),

    /// The server responded on a stream with no waiter.
    #[error("response on unknown stream id {0}")]
    UnknownStreamId(i16),

    /// A frame on the event stream (−1) was not an EVENT.
    #[error("non-EVENT frame ({0:?}) on stream -1")]
    NonEventFrameOnEventStream(ResponseOpcode),

    /// Writing a frame to the transport failed.
    #[error("write failed: {0}")]
    Write(std::io::Error),

    /// The connection was closed on purpose.
    #[error("connection closed by the client")]
    ClosedByClient,

    /// The router task is gone without reporting a cause.
    #[error("connection worker terminated")]
    WorkerTerminated,
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }

    /// Classifies the terminal cause into its user-facing kind.
    pub fn into_request_error(self) -> RequestError {
        use BrokenConnectionErrorKind::*;
        let wrap: fn(BrokenConnectionError) -> RequestError = match &*self.0 {
            Frame(frame_error) => match frame_error {
                FrameError::FrameFromClient
                | FrameError::VersionNotSupported(_)
                | FrameError::FrameTooLarge { .. }
                | FrameError::UnknownResponseOpcode(_)
                | FrameError::NoCompressionNegotiated => RequestError::ProtocolViolation,
                FrameError::ConnectionClosed { .. } | FrameError::Io(_) => {
                    RequestError::ConnectionClosed
                }
                _ => RequestError::BadData,
            },
            ResponseDecode(_) => RequestError::BadData,
            UnknownStreamId(_) | NonEventFrameOnEventStream(_) => RequestError::ProtocolViolation,
            Write(_) | ClosedByClient | WorkerTerminated => RequestError::ConnectionClosed,
        };
        wrap(self)
    }
}

/// An error establishing a session.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("could not open the transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The server demands authentication; this engine does not negotiate
    /// it (kind: unsupported).
    #[error("server demands authentication via {authenticator}, which is not supported")]
    AuthenticationRequired { authenticator: String },

    /// The handshake got a response it cannot act on.
    #[error("unexpected response to {request}: {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: &'static str,
    },

    #[error(transparent)]
    Request(#[from] RequestError),
}
