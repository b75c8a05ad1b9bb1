//! Decoded CQL cell values and the wrapper types behind them.

use std::net::IpAddr;

use uuid::Uuid;

/// Value of a `counter` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Counter(pub i64);

/// Days since −5877641-06-23, i.e. 2^31 days before the unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CqlDate(pub u32);

/// Milliseconds since the unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CqlTimestamp(pub i64);

/// Nanoseconds since midnight; valid range 0..=86399999999999.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CqlTime(pub i64);

/// A version-1 UUID ordered by its timestamp, as `timeuuid` columns are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CqlTimeuuid(Uuid);

impl CqlTimeuuid {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for CqlTimeuuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CqlTimeuuid> for Uuid {
    fn from(tuuid: CqlTimeuuid) -> Self {
        tuuid.0
    }
}

/// Arbitrary-precision integer, kept as its wire form: a signed
/// big-endian two's-complement byte string.
///
/// Equality is byte-wise; the driver does not normalise leading sign
/// bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CqlVarint(Vec<u8>);

impl CqlVarint {
    pub fn from_signed_bytes_be(digits: Vec<u8>) -> Self {
        Self(digits)
    }

    pub fn as_signed_bytes_be(&self) -> &[u8] {
        &self.0
    }
}

/// Arbitrary-precision decimal: a varint unscaled value and a base-10
/// scale, kept in wire form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CqlDecimal {
    int_val: CqlVarint,
    scale: i32,
}

impl CqlDecimal {
    pub fn from_signed_be_bytes_and_exponent(bytes: Vec<u8>, scale: i32) -> Self {
        Self {
            int_val: CqlVarint::from_signed_bytes_be(bytes),
            scale,
        }
    }

    pub fn as_signed_be_bytes_and_exponent(&self) -> (&[u8], i32) {
        (self.int_val.as_signed_bytes_be(), self.scale)
    }
}

/// A single decoded cell.
///
/// `Empty` is the zero-length payload some scalar types admit; it is
/// distinct from a null cell, which surfaces as `Option::None` one level
/// up.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    BigInt(i64),
    Blob(Vec<u8>),
    Boolean(bool),
    Counter(Counter),
    Date(CqlDate),
    Decimal(CqlDecimal),
    Double(f64),
    Empty,
    Float(f32),
    Inet(IpAddr),
    Int(i32),
    List(Vec<CqlValue>),
    /// Entries in server order.
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    SmallInt(i16),
    Text(String),
    Time(CqlTime),
    Timestamp(CqlTimestamp),
    Timeuuid(CqlTimeuuid),
    TinyInt(i8),
    Tuple(Vec<Option<CqlValue>>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        /// Field order matches the type definition.
        fields: Vec<(String, Option<CqlValue>)>,
    },
    Uuid(Uuid),
    Varint(CqlVarint),
}

impl CqlValue {
    pub fn as_ascii(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<Counter> {
        match self {
            Self::Counter(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<CqlDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[CqlValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(CqlValue, CqlValue)]> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&[CqlValue]> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_smallint(&self) -> Option<i16> {
        match self {
            Self::SmallInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<CqlTime> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<CqlTimestamp> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_timeuuid(&self) -> Option<CqlTimeuuid> {
        match self {
            Self::Timeuuid(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_tinyint(&self) -> Option<i8> {
        match self {
            Self::TinyInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Option<CqlValue>]> {
        match self {
            Self::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }
}
