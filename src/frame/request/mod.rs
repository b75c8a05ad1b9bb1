//! CQL requests sent by the client.

pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;
use thiserror::Error;

pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::{Query, QueryParameters};
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::LowLevelDeserializationError;
use super::types::Consistency;
use super::TryFromPrimitiveError;

/// Opcode identifying the request type in a frame header.
///
/// `Batch` and `AuthResponse` are wire constants only: their bodies are
/// not implemented.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError::new("RequestOpcode", value)),
        }
    }
}

/// A request body that can be serialized into a frame.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError>;

    fn to_bytes(&self) -> Result<Bytes, RequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

/// A request body that can be read back from its wire form.
///
/// The engine never deserializes requests; tests asserting on what was
/// sent do.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError>;
}

/// An error while serializing a request body. All variants boil down to a
/// field that cannot fit its length prefix.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum RequestSerializationError {
    #[error("startup options do not fit a string map: {0}")]
    StartupOptions(std::num::TryFromIntError),
    #[error("statement string too long: {0}")]
    StatementString(std::num::TryFromIntError),
    #[error("prepared statement id too long: {0}")]
    StatementId(std::num::TryFromIntError),
    #[error("paging state too long: {0}")]
    PagingState(std::num::TryFromIntError),
    #[error("event type list too long: {0}")]
    EventTypeList(std::num::TryFromIntError),
}

/// An error returned by [`DeserializableRequest::deserialize`].
#[derive(Debug, Error)]
pub enum RequestDeserializationError {
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unrecognised query flags: {flags:#04x}")]
    UnknownFlags { flags: u8 },
    #[error("named values are not supported")]
    NamedValuesUnsupported,
    #[error("expected a serial consistency, got {0}")]
    ExpectedSerialConsistency(Consistency),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

/// Any request with an implemented body, deserialized by opcode. Test
/// helper for mock servers.
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'r> {
    Startup(Startup<'r>),
    Options,
    Query(Query<'r>),
    Prepare(Prepare<'r>),
    Execute(Execute<'r>),
    Register(Register),
}

impl Request<'_> {
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
    ) -> Result<Self, RequestDeserializationError> {
        match opcode {
            RequestOpcode::Startup => Startup::deserialize(buf).map(Self::Startup),
            RequestOpcode::Options => Ok(Self::Options),
            RequestOpcode::Query => Query::deserialize(buf).map(Self::Query),
            RequestOpcode::Prepare => Prepare::deserialize(buf).map(Self::Prepare),
            RequestOpcode::Execute => Execute::deserialize(buf).map(Self::Execute),
            RequestOpcode::Register => Register::deserialize(buf).map(Self::Register),
            RequestOpcode::Batch | RequestOpcode::AuthResponse => {
                unimplemented!("deserialization of opcode {:?} is not supported", opcode)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::query::QueryParameters;
    use super::*;
    use crate::frame::response::result::{ColumnSpec, ColumnType, TableSpec};
    use crate::frame::types::{Consistency, SerialConsistency};
    use crate::frame::value::CqlValue;
    use crate::serialize::bind_values;
    use std::borrow::Cow;

    fn int_spec() -> ColumnSpec {
        ColumnSpec {
            table_spec: TableSpec {
                ks_name: "ks".into(),
                table_name: "t".into(),
            },
            name: "k".into(),
            typ: ColumnType::Int,
        }
    }

    #[test]
    fn query_ser_de_identity() {
        let query = Query {
            contents: Cow::Borrowed("SELECT * FROM system.peers"),
            parameters: QueryParameters {
                consistency: Consistency::Quorum,
                serial_consistency: Some(SerialConsistency::LocalSerial),
                timestamp: Some(1_600_000_000_000),
                page_size: Some(4096),
                paging_state: Some(vec![0xDE, 0xAD].into()),
                skip_metadata: false,
                values: Cow::Owned(
                    bind_values(&[Some(CqlValue::Int(2137))], &[int_spec()]).unwrap(),
                ),
            },
        };

        let mut buf = Vec::new();
        query.serialize(&mut buf).unwrap();
        let roundtrip = Query::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(roundtrip, query);
    }

    #[test]
    fn execute_ser_de_identity() {
        let execute = Execute {
            id: vec![1, 2, 3, 4].into(),
            parameters: QueryParameters {
                consistency: Consistency::One,
                serial_consistency: None,
                timestamp: None,
                page_size: None,
                paging_state: None,
                skip_metadata: false,
                values: Cow::Owned(
                    bind_values(&[Some(CqlValue::Int(42))], &[int_spec()]).unwrap(),
                ),
            },
        };

        let mut buf = Vec::new();
        execute.serialize(&mut buf).unwrap();
        let roundtrip = Execute::deserialize(&mut &buf[..]).unwrap();
        assert_eq!(roundtrip, execute);
    }

    #[test]
    fn unknown_query_flags_are_rejected() {
        let query = Query {
            contents: Cow::Borrowed("SELECT 1"),
            parameters: QueryParameters::default(),
        };
        let mut buf = Vec::new();
        query.serialize(&mut buf).unwrap();

        // Flags byte sits right behind the long string and consistency.
        let flags_idx = 4 + "SELECT 1".len() + 2;
        buf[flags_idx] |= 0x80;
        assert!(matches!(
            Query::deserialize(&mut &buf[..]),
            Err(RequestDeserializationError::UnknownFlags { flags: 0x80 })
        ));
    }

    #[test]
    fn request_opcode_round_trip() {
        for opcode in [
            RequestOpcode::Startup,
            RequestOpcode::Options,
            RequestOpcode::Query,
            RequestOpcode::Prepare,
            RequestOpcode::Execute,
            RequestOpcode::Register,
            RequestOpcode::Batch,
            RequestOpcode::AuthResponse,
        ] {
            assert_eq!(RequestOpcode::try_from(opcode as u8).unwrap(), opcode);
        }
        assert!(RequestOpcode::try_from(0x42).is_err());
    }
}
