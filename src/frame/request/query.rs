//! QUERY: executes a single unprepared statement.

use std::borrow::Cow;

use bytes::{Buf, BufMut, Bytes};

use crate::frame::request::{
    DeserializableRequest, RequestDeserializationError, RequestOpcode, RequestSerializationError,
    SerializableRequest,
};
use crate::frame::types::{self, Consistency, SerialConsistency};
use crate::serialize::SerializedValues;

// Query flags.
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const FLAG_WITH_NAMES_FOR_VALUES: u8 = 0x40;
const ALL_FLAGS: u8 = FLAG_VALUES
    | FLAG_SKIP_METADATA
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY
    | FLAG_WITH_DEFAULT_TIMESTAMP
    | FLAG_WITH_NAMES_FOR_VALUES;

#[derive(Debug, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), RequestSerializationError> {
        types::write_long_string(&self.contents, buf)
            .map_err(RequestSerializationError::StatementString)?;
        self.parameters.serialize(buf)
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = QueryParameters::deserialize(buf)?;
        Ok(Self {
            contents,
            parameters,
        })
    }
}

/// The parameter block shared by QUERY and EXECUTE: consistency, a flags
/// byte, then the fields the flags declare, in flag-bit order.
#[derive(Debug, PartialEq, Eq)]
pub struct QueryParameters<'a> {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub skip_metadata: bool,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: None,
            skip_metadata: false,
            values: Cow::Borrowed(crate::serialize::EMPTY_VALUES),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), RequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }
        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        buf.put_u8(flags);

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }
        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }
        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)
                .map_err(RequestSerializationError::PagingState)?;
        }
        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;

        let flags = buf.get_u8();
        let unknown_flags = flags & !ALL_FLAGS;
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }
        if flags & FLAG_WITH_NAMES_FOR_VALUES != 0 {
            return Err(RequestDeserializationError::NamedValuesUnsupported);
        }

        let values = Cow::Owned(if flags & FLAG_VALUES != 0 {
            SerializedValues::new_from_frame(buf)?
        } else {
            SerializedValues::new()
        });
        let page_size = if flags & FLAG_PAGE_SIZE != 0 {
            Some(types::read_int(buf)?)
        } else {
            None
        };
        let paging_state = if flags & FLAG_WITH_PAGING_STATE != 0 {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };
        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            let consistency = types::read_consistency(buf)?;
            Some(
                SerialConsistency::try_from(consistency as u16).map_err(|_| {
                    RequestDeserializationError::ExpectedSerialConsistency(consistency)
                })?,
            )
        } else {
            None
        };
        let timestamp = if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
            Some(types::read_long(buf)?)
        } else {
            None
        };

        Ok(Self {
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            paging_state,
            skip_metadata: flags & FLAG_SKIP_METADATA != 0,
            values,
        })
    }
}
