//! REGISTER: subscribes the connection to server-pushed events.

use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, RequestSerializationError,
    SerializableRequest,
};
use crate::frame::server_event_type::EventType;
use crate::frame::types;

#[derive(Debug, PartialEq, Eq)]
pub struct Register {
    pub event_types: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        let names: Vec<String> = self
            .event_types
            .iter()
            .map(|event| event.to_string())
            .collect();
        types::write_string_list(&names, buf).map_err(RequestSerializationError::EventTypeList)
    }
}

impl DeserializableRequest for Register {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let event_types = types::read_string_list(buf)?
            .into_iter()
            .map(|name| {
                name.parse::<EventType>()
                    .map_err(|_| RequestDeserializationError::UnknownEventType(name))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { event_types })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_body_is_a_string_list() {
        let register = Register {
            event_types: vec![EventType::SchemaChange],
        };
        let mut buf = Vec::new();
        register.serialize(&mut buf).unwrap();
        assert_eq!(
            buf,
            [
                0x00, 0x01, 0x00, 0x0D, b'S', b'C', b'H', b'E', b'M', b'A', b'_', b'C', b'H',
                b'A', b'N', b'G', b'E',
            ]
        );
        assert_eq!(Register::deserialize(&mut &buf[..]).unwrap(), register);
    }
}
