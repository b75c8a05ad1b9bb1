//! Binding of caller-supplied values into the QUERY/EXECUTE value block.
//!
//! Binding is checked against the column specs of the prepared statement
//! before any frame is written: an arity or type mismatch never reaches
//! the wire.

use bytes::BufMut;
use thiserror::Error;

use crate::frame::response::result::ColumnType;
use crate::frame::types;
use crate::frame::value::CqlValue;

/// A positional value list in wire form: each entry a `[value]`, written
/// into the parameter block behind a `[short]` count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

/// An empty value list, usable wherever `&SerializedValues` is expected.
pub const EMPTY_VALUES: &SerializedValues = &SerializedValues {
    serialized_values: Vec::new(),
    element_count: 0,
};

impl Default for SerializedValues {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializedValues {
    pub fn new() -> Self {
        Self {
            serialized_values: Vec::new(),
            element_count: 0,
        }
    }

    /// Binds one value against its column type and appends it.
    /// `None` binds a null.
    pub fn add_value(
        &mut self,
        value: Option<&CqlValue>,
        typ: &ColumnType,
    ) -> Result<(), BindError> {
        if self.element_count == u16::MAX {
            return Err(BindError::TooManyValues);
        }
        match value {
            None => types::write_int(-1, &mut self.serialized_values),
            Some(value) => {
                let mut cell = Vec::new();
                serialize_cell(value, typ, &mut cell)?;
                types::write_bytes(&cell, &mut self.serialized_values)
                    .map_err(|_| BindError::ValueTooLarge)?;
            }
        }
        self.element_count += 1;
        Ok(())
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    /// Writes the `[short] count` + values block of QUERY/EXECUTE.
    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized_values);
    }

    /// Reads a value block back. Only exercised by tests asserting on
    /// sent requests.
    pub fn new_from_frame(
        buf: &mut &[u8],
    ) -> Result<Self, crate::frame::frame_errors::LowLevelDeserializationError> {
        let element_count = types::read_short(buf)?;
        let mut serialized_values = Vec::new();
        for _ in 0..element_count {
            let value = types::read_value(buf)?;
            types::write_value(value, &mut serialized_values)?;
        }
        Ok(Self {
            serialized_values,
            element_count,
        })
    }

    /// Iterates over the raw `[value]`s. Test helper.
    pub fn iter(&self) -> impl Iterator<Item = types::RawValue<'_>> {
        let mut buf = &self.serialized_values[..];
        std::iter::from_fn(move || {
            if buf.is_empty() {
                None
            } else {
                types::read_value(&mut buf).ok()
            }
        })
    }
}

/// A caller-side binding failure, detected before any I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    #[error("statement takes {expected} bind parameter(s), {got} value(s) given")]
    ArityMismatch { expected: usize, got: usize },
    #[error("value {value_debug} cannot be bound to column `{column}` of type {expected:?}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        value_debug: String,
    },
    #[error("binding values of type {0} is not supported")]
    UnsupportedType(&'static str),
    #[error("serialized value exceeds the protocol's 2 GiB cell limit")]
    ValueTooLarge,
    #[error("more than 65535 values in one statement")]
    TooManyValues,
    #[error("string bound to an ascii column contains non-ascii characters")]
    NonAsciiString,
    #[error("time value {0} is out of the valid range 0..=86399999999999")]
    TimeOutOfRange(i64),
}

fn mismatch(value: &CqlValue, typ: &ColumnType) -> BindError {
    BindError::TypeMismatch {
        column: String::new(),
        expected: typ.clone(),
        value_debug: format!("{:?}", value),
    }
}

/// Encodes one cell payload (without the `[bytes]` length prefix),
/// recursing on collection and tuple types.
fn serialize_cell(value: &CqlValue, typ: &ColumnType, out: &mut Vec<u8>) -> Result<(), BindError> {
    use ColumnType::*;

    match (typ, value) {
        // A zero-length payload is legal for most scalars.
        (_, CqlValue::Empty) => Ok(()),

        (Ascii, CqlValue::Ascii(s)) => {
            if !s.is_ascii() {
                return Err(BindError::NonAsciiString);
            }
            out.extend_from_slice(s.as_bytes());
            Ok(())
        }
        (Text, CqlValue::Text(s)) | (Text, CqlValue::Ascii(s)) => {
            out.extend_from_slice(s.as_bytes());
            Ok(())
        }
        (Blob, CqlValue::Blob(b)) => {
            out.extend_from_slice(b);
            Ok(())
        }
        (Boolean, CqlValue::Boolean(b)) => {
            out.push(*b as u8);
            Ok(())
        }
        (TinyInt, CqlValue::TinyInt(v)) => {
            out.push(*v as u8);
            Ok(())
        }
        (SmallInt, CqlValue::SmallInt(v)) => {
            out.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        (Int, CqlValue::Int(v)) => {
            out.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        (BigInt, CqlValue::BigInt(v)) => {
            out.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        (Counter, CqlValue::Counter(c)) => {
            out.extend_from_slice(&c.0.to_be_bytes());
            Ok(())
        }
        (Float, CqlValue::Float(v)) => {
            out.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        (Double, CqlValue::Double(v)) => {
            out.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        (Date, CqlValue::Date(d)) => {
            out.extend_from_slice(&d.0.to_be_bytes());
            Ok(())
        }
        (Time, CqlValue::Time(t)) => {
            if !(0..=86_399_999_999_999).contains(&t.0) {
                return Err(BindError::TimeOutOfRange(t.0));
            }
            out.extend_from_slice(&t.0.to_be_bytes());
            Ok(())
        }
        (Timestamp, CqlValue::Timestamp(t)) => {
            out.extend_from_slice(&t.0.to_be_bytes());
            Ok(())
        }
        (Uuid, CqlValue::Uuid(u)) => {
            out.extend_from_slice(u.as_bytes());
            Ok(())
        }
        (Timeuuid, CqlValue::Timeuuid(u)) => {
            out.extend_from_slice(u.as_bytes());
            Ok(())
        }
        (Inet, CqlValue::Inet(addr)) => {
            match addr {
                std::net::IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
                std::net::IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
            }
            Ok(())
        }
        (Varint, CqlValue::Varint(v)) => {
            out.extend_from_slice(v.as_signed_bytes_be());
            Ok(())
        }
        (Decimal, CqlValue::Decimal(d)) => {
            let (bytes, scale) = d.as_signed_be_bytes_and_exponent();
            types::write_int(scale, out);
            out.extend_from_slice(bytes);
            Ok(())
        }

        (List(elem_typ), CqlValue::List(elems)) | (Set(elem_typ), CqlValue::Set(elems)) => {
            types::write_int_length(elems.len(), out).map_err(|_| BindError::ValueTooLarge)?;
            for elem in elems {
                let mut cell = Vec::new();
                serialize_cell(elem, elem_typ, &mut cell)?;
                types::write_bytes(&cell, out).map_err(|_| BindError::ValueTooLarge)?;
            }
            Ok(())
        }
        (Map(key_typ, val_typ), CqlValue::Map(entries)) => {
            types::write_int_length(entries.len(), out).map_err(|_| BindError::ValueTooLarge)?;
            for (key, val) in entries {
                let mut cell = Vec::new();
                serialize_cell(key, key_typ, &mut cell)?;
                types::write_bytes(&cell, out).map_err(|_| BindError::ValueTooLarge)?;
                cell.clear();
                serialize_cell(val, val_typ, &mut cell)?;
                types::write_bytes(&cell, out).map_err(|_| BindError::ValueTooLarge)?;
            }
            Ok(())
        }
        (Tuple(elem_types), CqlValue::Tuple(elems)) => {
            if elem_types.len() != elems.len() {
                return Err(mismatch(value, typ));
            }
            for (elem, elem_typ) in elems.iter().zip(elem_types) {
                match elem {
                    None => types::write_int(-1, out),
                    Some(elem) => {
                        let mut cell = Vec::new();
                        serialize_cell(elem, elem_typ, &mut cell)?;
                        types::write_bytes(&cell, out).map_err(|_| BindError::ValueTooLarge)?;
                    }
                }
            }
            Ok(())
        }

        (UserDefinedType { .. }, _) => Err(BindError::UnsupportedType("user-defined type")),
        (Custom(_), _) => Err(BindError::UnsupportedType("custom")),

        _ => Err(mismatch(value, typ)),
    }
}

/// Binds a positional value list against the given column specs.
///
/// Fails on arity mismatch before looking at any value; a per-value type
/// mismatch names the offending column.
pub fn bind_values(
    values: &[Option<CqlValue>],
    specs: &[crate::frame::response::result::ColumnSpec],
) -> Result<SerializedValues, BindError> {
    if values.len() != specs.len() {
        return Err(BindError::ArityMismatch {
            expected: specs.len(),
            got: values.len(),
        });
    }
    let mut serialized = SerializedValues::new();
    for (value, spec) in values.iter().zip(specs) {
        serialized
            .add_value(value.as_ref(), &spec.typ)
            .map_err(|e| match e {
                BindError::TypeMismatch {
                    expected,
                    value_debug,
                    ..
                } => BindError::TypeMismatch {
                    column: spec.name.clone(),
                    expected,
                    value_debug,
                },
                other => other,
            })?;
    }
    Ok(serialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::response::result::{ColumnSpec, TableSpec};
    use crate::frame::value::{CqlTime, CqlTimestamp};
    use assert_matches::assert_matches;

    fn spec(name: &str, typ: ColumnType) -> ColumnSpec {
        ColumnSpec {
            table_spec: TableSpec {
                ks_name: "ks".into(),
                table_name: "t".into(),
            },
            name: name.into(),
            typ,
        }
    }

    #[test]
    fn int_binds_to_four_be_bytes() {
        let serialized =
            bind_values(&[Some(CqlValue::Int(42))], &[spec("k", ColumnType::Int)]).unwrap();
        let mut buf = Vec::new();
        serialized.write_to_request(&mut buf);
        assert_eq!(buf, [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x2A]);
    }

    #[test]
    fn null_binds_as_minus_one_length() {
        let serialized = bind_values(&[None], &[spec("k", ColumnType::Int)]).unwrap();
        let mut buf = Vec::new();
        serialized.write_to_request(&mut buf);
        assert_eq!(buf, [0x00, 0x01, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn arity_mismatch_is_rejected_before_any_value() {
        let err = bind_values(
            &[Some(CqlValue::Int(1)), Some(CqlValue::Int(2))],
            &[spec("k", ColumnType::Int)],
        )
        .unwrap_err();
        assert_matches!(
            err,
            BindError::ArityMismatch {
                expected: 1,
                got: 2
            }
        );
    }

    #[test]
    fn type_mismatch_names_the_column() {
        let err = bind_values(
            &[Some(CqlValue::Text("oops".into()))],
            &[spec("user_id", ColumnType::Int)],
        )
        .unwrap_err();
        assert_matches!(err, BindError::TypeMismatch { ref column, .. } if column == "user_id");
    }

    #[test]
    fn list_of_text_binds_elementwise() {
        let serialized = bind_values(
            &[Some(CqlValue::List(vec![
                CqlValue::Text("a".into()),
                CqlValue::Text("bc".into()),
            ]))],
            &[spec("tags", ColumnType::List(Box::new(ColumnType::Text)))],
        )
        .unwrap();
        let mut buf = Vec::new();
        serialized.write_to_request(&mut buf);
        // count=1, cell len=15, elem count=2, "a", "bc"
        assert_eq!(
            buf,
            [
                0x00, 0x01, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
                0x01, b'a', 0x00, 0x00, 0x00, 0x02, b'b', b'c'
            ]
        );
    }

    #[test]
    fn tuple_arity_is_checked() {
        let err = bind_values(
            &[Some(CqlValue::Tuple(vec![Some(CqlValue::Int(1))]))],
            &[spec(
                "pair",
                ColumnType::Tuple(vec![ColumnType::Int, ColumnType::Text]),
            )],
        )
        .unwrap_err();
        assert_matches!(err, BindError::TypeMismatch { .. });
    }

    #[test]
    fn udt_binding_is_unsupported() {
        let err = bind_values(
            &[Some(CqlValue::Int(1))],
            &[spec(
                "u",
                ColumnType::UserDefinedType {
                    keyspace: "ks".into(),
                    type_name: "addr".into(),
                    field_types: vec![],
                },
            )],
        )
        .unwrap_err();
        assert_matches!(err, BindError::UnsupportedType("user-defined type"));
    }

    #[test]
    fn ascii_column_rejects_non_ascii() {
        let err = bind_values(
            &[Some(CqlValue::Ascii("żółw".into()))],
            &[spec("a", ColumnType::Ascii)],
        )
        .unwrap_err();
        assert_matches!(err, BindError::NonAsciiString);
    }

    #[test]
    fn time_out_of_range_is_rejected() {
        let err = bind_values(
            &[Some(CqlValue::Time(CqlTime(-1)))],
            &[spec("t", ColumnType::Time)],
        )
        .unwrap_err();
        assert_matches!(err, BindError::TimeOutOfRange(-1));
    }

    #[test]
    fn timestamp_binds_to_eight_be_bytes() {
        let serialized = bind_values(
            &[Some(CqlValue::Timestamp(CqlTimestamp(1)))],
            &[spec("ts", ColumnType::Timestamp)],
        )
        .unwrap();
        let mut buf = Vec::new();
        serialized.write_to_request(&mut buf);
        assert_eq!(
            buf,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x08, 0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn values_survive_frame_round_trip() {
        let serialized = bind_values(
            &[Some(CqlValue::Int(7)), None],
            &[spec("a", ColumnType::Int), spec("b", ColumnType::Text)],
        )
        .unwrap();
        let mut buf = Vec::new();
        serialized.write_to_request(&mut buf);
        let reread = SerializedValues::new_from_frame(&mut &buf[..]).unwrap();
        assert_eq!(reread, serialized);
        let raw: Vec<_> = reread.iter().collect();
        assert_eq!(
            raw,
            vec![
                types::RawValue::Value(&[0, 0, 0, 7]),
                types::RawValue::Null
            ]
        );
    }
}
