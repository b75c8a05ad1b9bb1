//! STARTUP: finalises connection negotiation.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, RequestSerializationError,
    SerializableRequest,
};
use crate::frame::types;

pub const CQL_VERSION: &str = "CQL_VERSION";
pub const COMPRESSION: &str = "COMPRESSION";
pub const NO_COMPACT: &str = "NO_COMPACT";
pub const THROW_ON_OVERLOAD: &str = "THROW_ON_OVERLOAD";

/// Default value of the mandatory `CQL_VERSION` option.
pub const DEFAULT_CQL_VERSION: &str = "3.4.4";

/// The STARTUP body: a string map of accepted options. `CQL_VERSION` is
/// mandatory; `COMPRESSION` is present only when an algorithm was
/// negotiated.
#[derive(Debug, PartialEq, Eq)]
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_string_map(&self.options, buf)
            .map_err(RequestSerializationError::StartupOptions)
    }
}

impl DeserializableRequest for Startup<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let options = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { options })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_body_matches_wire_layout() {
        let mut options = HashMap::new();
        options.insert(Cow::Borrowed(CQL_VERSION), Cow::Borrowed("3.4.4"));
        let startup = Startup { options };

        let mut buf = Vec::new();
        startup.serialize(&mut buf).unwrap();
        assert_eq!(
            buf,
            [
                0x00, 0x01, // one entry
                0x00, 0x0B, b'C', b'Q', b'L', b'_', b'V', b'E', b'R', b'S', b'I', b'O', b'N',
                0x00, 0x05, b'3', b'.', b'4', b'.', b'4',
            ]
        );
        assert_eq!(buf.len(), 0x16);
    }
}
