//! ERROR: a well-formed failure reported by the server.
//!
//! An ERROR is delivered to the waiter of its stream like any other
//! response; it never tears the connection down.

use byteorder::ReadBytesExt;
use bytes::Bytes;
use thiserror::Error;

use crate::frame::frame_errors::ParseError;
use crate::frame::types::{self, Consistency};

#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    /// Human-readable message sent with the code.
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: buf.read_u8()? != 0,
            },
            0x1300 => DbError::ReadFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                data_present: buf.read_u8()? != 0,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_owned(),
                function: types::read_string(buf)?.to_owned(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_owned(),
                table: types::read_string(buf)?.to_owned(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::from(types::read_short_bytes(buf)?.to_owned()),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }
}

/// The error codes of the native protocol, with their code-specific
/// payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("internal server error")]
    ServerError,

    #[error("protocol violation reported by the server")]
    ProtocolError,

    #[error("authentication failed")]
    AuthenticationError,

    #[error(
        "not enough replicas alive for consistency {consistency} \
        (required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("coordinator is overloaded")]
    Overloaded,

    #[error("coordinator is still bootstrapping")]
    IsBootstrapping,

    #[error("truncate failed")]
    TruncateError,

    #[error(
        "write timeout at consistency {consistency} \
        (received: {received}, required: {required}, write_type: {write_type})"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    #[error(
        "read timeout at consistency {consistency} \
        (received: {received}, required: {required}, data_present: {data_present})"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    #[error("read failure at consistency {consistency} ({numfailures} replica failure(s))")]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    #[error("user-defined function {keyspace}.{function} failed")]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("write failure at consistency {consistency} ({numfailures} replica failure(s))")]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    #[error("statement has a syntax error")]
    SyntaxError,

    #[error("user is not authorized to perform the statement")]
    Unauthorized,

    #[error("statement is syntactically correct but invalid")]
    Invalid,

    #[error("statement is invalid due to a configuration issue")]
    ConfigError,

    #[error("keyspace or table already exists (keyspace: {keyspace}, table: {table})")]
    AlreadyExists { keyspace: String, table: String },

    #[error("prepared statement id is not known to the server")]
    Unprepared { statement_id: Bytes },

    #[error("unknown error code: {0:#06x}")]
    Other(i32),
}

impl DbError {
    /// The wire code of this error.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// Type of the write named in a write timeout/failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl From<&str> for WriteType {
    fn from(name: &str) -> WriteType {
        match name {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(name.to_owned()),
        }
    }
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteType::Other(name) => f.write_str(name),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(code: i32, reason: &str, extra: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        types::write_int(code, &mut buf);
        types::write_string(reason, &mut buf).unwrap();
        buf.extend_from_slice(extra);
        buf
    }

    #[test]
    fn invalid_error_keeps_code_and_reason() {
        let buf = encode(0x2200, "unconfigured table nope", &[]);
        let error = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(error.error, DbError::Invalid);
        assert_eq!(error.error.code(), 0x2200);
        assert_eq!(error.reason, "unconfigured table nope");
    }

    #[test]
    fn unavailable_reads_its_extra_fields() {
        let mut extra = Vec::new();
        types::write_consistency(Consistency::Quorum, &mut extra);
        types::write_int(3, &mut extra);
        types::write_int(1, &mut extra);
        let buf = encode(0x1000, "not enough nodes", &extra);

        let error = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 3,
                alive: 1,
            }
        );
    }

    #[test]
    fn write_timeout_reads_write_type() {
        let mut extra = Vec::new();
        types::write_consistency(Consistency::One, &mut extra);
        types::write_int(0, &mut extra);
        types::write_int(1, &mut extra);
        types::write_string("SIMPLE", &mut extra).unwrap();
        let buf = encode(0x1100, "timed out", &extra);

        let error = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::WriteTimeout {
                consistency: Consistency::One,
                received: 0,
                required: 1,
                write_type: WriteType::Simple,
            }
        );
    }

    #[test]
    fn unprepared_carries_the_stale_id() {
        let mut extra = Vec::new();
        types::write_short_bytes(&[0xAA, 0xBB], &mut extra).unwrap();
        let buf = encode(0x2500, "unknown statement", &extra);

        let error = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(
            error.error,
            DbError::Unprepared {
                statement_id: Bytes::from_static(&[0xAA, 0xBB]),
            }
        );
    }

    #[test]
    fn unknown_code_is_preserved() {
        let buf = encode(0x7777, "???", &[]);
        let error = Error::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(error.error, DbError::Other(0x7777));
        assert_eq!(error.error.code(), 0x7777);
    }
}
