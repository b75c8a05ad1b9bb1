//! EXECUTE: runs a previously prepared statement.

use bytes::Bytes;

use crate::frame::request::{
    query::QueryParameters, DeserializableRequest, RequestDeserializationError, RequestOpcode,
    RequestSerializationError, SerializableRequest,
};
use crate::frame::types;

#[derive(Debug, PartialEq, Eq)]
pub struct Execute<'a> {
    /// Server-assigned id from the RESULT::Prepared that created the
    /// statement.
    pub id: Bytes,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_short_bytes(&self.id[..], buf)
            .map_err(RequestSerializationError::StatementId)?;
        self.parameters.serialize(buf)
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let id = types::read_short_bytes(buf)?.to_vec().into();
        let parameters = QueryParameters::deserialize(buf)?;
        Ok(Self { id, parameters })
    }
}
