//! OPTIONS: asks which STARTUP options the server supports.

use crate::frame::request::{RequestOpcode, RequestSerializationError, SerializableRequest};

/// The OPTIONS request carries no body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        Ok(())
    }
}
