//! RESULT: dispatch on the leading `[int]` kind, plus row decoding.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, Bytes};
use std::result::Result as StdResult;
use std::str;

use crate::frame::frame_errors::ParseError;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::frame::value::{
    CqlDate, CqlDecimal, CqlTime, CqlTimestamp, CqlTimeuuid, CqlValue, CqlVarint,
};

// Result metadata flags.
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

/// Table a column belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

/// Recursive type descriptor of a column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    /// Unknown marshal class; the class name is kept, cell payloads are
    /// not interpreted.
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Date,
    Decimal,
    Double,
    Float,
    Inet,
    Int,
    SmallInt,
    Text,
    Time,
    Timestamp,
    Timeuuid,
    TinyInt,
    Uuid,
    Varint,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Tuple(Vec<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        field_types: Vec<(String, ColumnType)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    pub col_count: usize,
    /// Opaque cursor the server sends when a page is not the last one.
    /// Paging is not driven by this engine; the state is surfaced as-is.
    pub paging_state: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Clone)]
pub struct PreparedMetadata {
    pub col_count: usize,
    /// Indexes of the partition-key columns within the bind parameters.
    pub pk_indexes: Vec<u16>,
    pub col_specs: Vec<ColumnSpec>,
}

/// One decoded row; a `None` cell is a database null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_owned();
            let type_name = types::read_string(buf)?.to_owned();
            let field_count: usize = types::read_short(buf)?.into();
            let mut field_types = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                let field_name = types::read_string(buf)?.to_owned();
                field_types.push((field_name, deser_type(buf)?));
            }
            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let len: usize = types::read_short(buf)?.into();
            let mut elem_types = Vec::with_capacity(len);
            for _ in 0..len {
                elem_types.push(deser_type(buf)?);
            }
            Tuple(elem_types)
        }
        id => return Err(ParseError::UnknownColumnType(id)),
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(buf: &mut &[u8]) -> StdResult<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count: usize = types::read_int_length(buf)?;

    let paging_state = if has_more_pages {
        Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        col_specs,
    })
}

fn deser_prepared_metadata(buf: &mut &[u8]) -> StdResult<PreparedMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count = types::read_int_length(buf)?;
    let pk_count = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::with_capacity(pk_count);
    for _ in 0..pk_count {
        pk_indexes.push(types::read_short(buf)?);
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn malformed(type_name: &'static str, reason: impl ToString) -> ParseError {
    ParseError::MalformedCell {
        type_name,
        reason: reason.to_string(),
    }
}

fn check_len(type_name: &'static str, buf: &[u8], expected: usize) -> StdResult<(), ParseError> {
    if buf.len() != expected {
        return Err(malformed(
            type_name,
            format!("expected {} bytes, got {}", expected, buf.len()),
        ));
    }
    Ok(())
}

/// Decodes one cell payload according to its type descriptor, by
/// structural recursion on the descriptor.
pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> StdResult<CqlValue, ParseError> {
    use ColumnType::*;

    if buf.is_empty() {
        match typ {
            // Zero-length is a regular value for the string-ish types.
            Ascii | Blob | Text => {}
            _ => return Ok(CqlValue::Empty),
        }
    }

    Ok(match typ {
        Custom(_) => CqlValue::Blob(buf.to_vec()),
        Ascii => {
            if !buf.is_ascii() {
                return Err(malformed("ascii", "payload contains non-ascii bytes"));
            }
            CqlValue::Ascii(str::from_utf8(buf).map_err(|e| malformed("ascii", e))?.to_owned())
        }
        Text => CqlValue::Text(str::from_utf8(buf).map_err(|e| malformed("text", e))?.to_owned()),
        Blob => CqlValue::Blob(buf.to_vec()),
        Boolean => {
            check_len("boolean", buf, 1)?;
            CqlValue::Boolean(buf[0] != 0x00)
        }
        TinyInt => {
            check_len("tinyint", buf, 1)?;
            CqlValue::TinyInt(buf.read_i8()?)
        }
        SmallInt => {
            check_len("smallint", buf, 2)?;
            CqlValue::SmallInt(buf.read_i16::<BigEndian>()?)
        }
        Int => {
            check_len("int", buf, 4)?;
            CqlValue::Int(buf.read_i32::<BigEndian>()?)
        }
        BigInt => {
            check_len("bigint", buf, 8)?;
            CqlValue::BigInt(buf.read_i64::<BigEndian>()?)
        }
        Counter => {
            check_len("counter", buf, 8)?;
            CqlValue::Counter(crate::frame::value::Counter(buf.read_i64::<BigEndian>()?))
        }
        Float => {
            check_len("float", buf, 4)?;
            CqlValue::Float(buf.read_f32::<BigEndian>()?)
        }
        Double => {
            check_len("double", buf, 8)?;
            CqlValue::Double(buf.read_f64::<BigEndian>()?)
        }
        Date => {
            check_len("date", buf, 4)?;
            CqlValue::Date(CqlDate(buf.read_u32::<BigEndian>()?))
        }
        Time => {
            check_len("time", buf, 8)?;
            let nanoseconds = buf.read_i64::<BigEndian>()?;
            if !(0..=86_399_999_999_999).contains(&nanoseconds) {
                return Err(malformed(
                    "time",
                    format!("{} is outside 0..=86399999999999", nanoseconds),
                ));
            }
            CqlValue::Time(CqlTime(nanoseconds))
        }
        Timestamp => {
            check_len("timestamp", buf, 8)?;
            CqlValue::Timestamp(CqlTimestamp(buf.read_i64::<BigEndian>()?))
        }
        Uuid => {
            check_len("uuid", buf, 16)?;
            CqlValue::Uuid(types::read_uuid(buf)?)
        }
        Timeuuid => {
            check_len("timeuuid", buf, 16)?;
            CqlValue::Timeuuid(CqlTimeuuid::from(types::read_uuid(buf)?))
        }
        Inet => CqlValue::Inet(match buf.len() {
            4 => {
                let octets = <[u8; 4]>::try_from(&buf[0..4]).unwrap();
                buf.advance(4);
                std::net::IpAddr::from(octets)
            }
            16 => {
                let octets = <[u8; 16]>::try_from(&buf[0..16]).unwrap();
                buf.advance(16);
                std::net::IpAddr::from(octets)
            }
            n => return Err(malformed("inet", format!("address length {}", n))),
        }),
        Varint => CqlValue::Varint(CqlVarint::from_signed_bytes_be(buf.to_vec())),
        Decimal => {
            let scale = types::read_int(buf)?;
            CqlValue::Decimal(CqlDecimal::from_signed_be_bytes_and_exponent(
                buf.to_vec(),
                scale,
            ))
        }
        List(elem_typ) => {
            let len = types::read_int_length(buf)?;
            let mut elems = Vec::with_capacity(len);
            for _ in 0..len {
                let mut cell = types::read_bytes(buf)?;
                elems.push(deser_cql_value(elem_typ, &mut cell)?);
            }
            CqlValue::List(elems)
        }
        Set(elem_typ) => {
            let len = types::read_int_length(buf)?;
            let mut elems = Vec::with_capacity(len);
            for _ in 0..len {
                let mut cell = types::read_bytes(buf)?;
                elems.push(deser_cql_value(elem_typ, &mut cell)?);
            }
            CqlValue::Set(elems)
        }
        Map(key_typ, val_typ) => {
            let len = types::read_int_length(buf)?;
            let mut entries = Vec::with_capacity(len);
            for _ in 0..len {
                let mut cell = types::read_bytes(buf)?;
                let key = deser_cql_value(key_typ, &mut cell)?;
                let mut cell = types::read_bytes(buf)?;
                let val = deser_cql_value(val_typ, &mut cell)?;
                entries.push((key, val));
            }
            CqlValue::Map(entries)
        }
        Tuple(elem_types) => {
            let mut elems = Vec::with_capacity(elem_types.len());
            for elem_typ in elem_types {
                match types::read_bytes_opt(buf)? {
                    Some(mut cell) => elems.push(Some(deser_cql_value(elem_typ, &mut cell)?)),
                    None => elems.push(None),
                }
            }
            CqlValue::Tuple(elems)
        }
        UserDefinedType {
            keyspace,
            type_name,
            field_types,
        } => {
            let mut fields = Vec::with_capacity(field_types.len());
            for (field_name, field_typ) in field_types {
                // A UDT serialized before fields were added to the type
                // simply ends early.
                if buf.is_empty() {
                    break;
                }
                let field_value = match types::read_bytes_opt(buf)? {
                    Some(mut cell) => Some(deser_cql_value(field_typ, &mut cell)?),
                    None => None,
                };
                fields.push((field_name.clone(), field_value));
            }
            CqlValue::UserDefinedType {
                keyspace: keyspace.clone(),
                type_name: type_name.clone(),
                fields,
            }
        }
    })
}

fn deser_rows(buf: &mut &[u8]) -> StdResult<Rows, ParseError> {
    let metadata = deser_result_metadata(buf)?;

    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for spec in &metadata.col_specs {
            let value = match types::read_bytes_opt(buf)? {
                Some(mut cell) => Some(deser_cql_value(&spec.typ, &mut cell)?),
                None => None,
            };
            columns.push(value);
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        rows_count,
        rows,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    Ok(SetKeyspace {
        keyspace_name: types::read_string(buf)?.to_owned(),
    })
}

fn deser_prepared(buf: &mut &[u8]) -> StdResult<Prepared, ParseError> {
    let id = Bytes::from(types::read_short_bytes(buf)?.to_owned());
    let prepared_metadata = deser_prepared_metadata(buf)?;
    let result_metadata = deser_result_metadata(buf)?;
    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(buf)?,
    })
}

pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(buf)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        kind => return Err(ParseError::UnknownResultKind(kind)),
    })
}
