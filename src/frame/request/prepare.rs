//! PREPARE: asks the server to parse and plan a statement.

use std::borrow::Cow;

use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, RequestSerializationError,
    SerializableRequest,
};
use crate::frame::types;

#[derive(Debug, PartialEq, Eq)]
pub struct Prepare<'a> {
    pub query: Cow<'a, str>,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_long_string(&self.query, buf)
            .map_err(RequestSerializationError::StatementString)
    }
}

impl DeserializableRequest for Prepare<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        Ok(Self {
            query: Cow::Owned(types::read_long_string(buf)?.to_owned()),
        })
    }
}
