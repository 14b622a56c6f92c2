//! Represent CA DBR representations, for data interchange.
//!
//! CA defines thirty-five [DBR] kinds as special structures used to transfer data back
//! and forth. These can be broken down into seven basic array types, which define the
//! data, and five categories of attached metadata. This module models the parts of
//! that the bridge needs, and provides tools for converting between data types and
//! encoding to/from the raw buffers the protocol layer hands over.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`]. All numeric data types in CA are signed:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`]), called `SHORT` in most EPICS tooling
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]) - an index into a table of at most
//!   [`MAX_ENUM_STATES`] labels, which is only transferred in the graphics and control
//!   categories.
//! - [`DbrValue::String`] - natively in CA this is a `[u8; 40]`, but for interchange
//!   here is represented by [`Vec<String>`], and is converted back and forth to
//!   fixed-length as required.
//!
//! The metadata categories are enumerated by [`DbrCategory`] and represented by
//! [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - All of [`Dbr::Status`], plus a timestamp. This is what the client
//!   side of the bridge always asks for.
//! - [`Dbr::Graphics`] and [`Dbr::Control`] - units, limits, precision and enum
//!   labels. These are produced by published variables but are not encoded to raw
//!   buffers by this crate.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    Parser,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::cast::AsPrimitive;
use std::{
    cmp,
    convert::TryFrom,
    fmt,
    io::{self, Cursor},
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::messages::ErrorCondition;

// Constants from EPICS
pub const MAX_STRING_SIZE: usize = 40;
pub const MAX_UNITS_SIZE: usize = 8;
pub const MAX_ENUM_STRING_SIZE: usize = 26;
pub const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
pub const POSIX_TIME_AT_EPICS_EPOCH: u64 = 631152000;

/// Encode a String to a fixed-maximum-length byte array
///
/// Problem: We want to convert a string to a byte sequence but never a length >
/// 40 (the fixed length of EPICS CA Strings). But we can't convert and truncate
/// because although we don't _expect_ to ever handle non-ASCII it technically
/// isn't guaranteed. So, convert one-character-at-a-time until the length would
/// go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer
}

/// Represent actual data transferred over CA
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Types of errors that can be returned from [`DbrValue::parse_into`]
#[derive(Debug, thiserror::Error)]
pub enum DbrParseError {
    #[error("Value is not a string")]
    SelfIsNotString,
    #[error("Cannot parse '{0}'")]
    CannotParse(String),
}

/// Failure decoding a raw buffer handed over by the protocol layer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DbrDecodeError {
    #[error("Truncated or malformed DBR buffer")]
    Malformed,
    #[error("String element is not valid UTF-8")]
    InvalidString,
    #[error("Decoding {0} buffers is not supported")]
    Unsupported(DbrType),
}

/// Run a nom parser over a raw buffer, reporting any failure as malformed
fn decode<'a, O>(
    mut parser: impl Parser<&'a [u8], Output = O, Error = nom::error::Error<&'a [u8]>>,
    data: &'a [u8],
) -> Result<(&'a [u8], O), DbrDecodeError> {
    parser.parse(data).map_err(|_| DbrDecodeError::Malformed)
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the DbrValue is not String or if the value cannot be parsed. Asking
    /// for a convertion from String->String just copies without doing any extra parsing.
    /// Enum parsing only understands numeric indices; labels need the owning table.
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrParseError> {
        fn _parse_all<T: FromStr>(val: &[String]) -> Result<Vec<T>, DbrParseError> {
            val.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return Err(DbrParseError::SelfIsNotString);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => match val.as_slice() {
                [single] => DbrValue::Enum(
                    single
                        .trim()
                        .parse()
                        .map_err(|_| DbrParseError::CannotParse(single.clone()))?,
                ),
                _ => return Err(DbrParseError::CannotParse(val.join(" "))),
            },
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(_parse_all(val)?),
            DbrBasicType::Int => DbrValue::Int(_parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_all(val)?),
        })
    }

    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T]) -> Result<Vec<U>, ErrorCondition>
        where
            T: Copy + num::NumCast,
            U: num::NumCast,
        {
            from.iter()
                .map(|n| num::NumCast::from(*n).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        /// Convert a single-item string to a numeric array
        fn _encode_string<T>(from: &[String]) -> Result<Vec<T>, ErrorCondition>
        where
            T: Copy + 'static,
            u8: AsPrimitive<T>,
        {
            Ok(match from {
                [] => Vec::new(),
                [val] => val.as_bytes().iter().map(|c| c.as_()).collect(),
                _ => Err(ErrorCondition::NoConvert)?,
            })
        }
        fn _format_all<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(|v| v.to_string()).collect()
        }

        Ok(match basic_type {
            DbrBasicType::Char => match self {
                DbrValue::Char(_val) => self.clone(),
                DbrValue::Int(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Char(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Char(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Char(vec![
                        num::NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?,
                    ])
                }
            },
            DbrBasicType::Int => match self {
                DbrValue::Char(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Int(_val) => self.clone(),
                DbrValue::Long(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Int(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Int(_encode_string(val)?),
                DbrValue::Enum(val) => {
                    DbrValue::Int(vec![
                        num::NumCast::from(*val).ok_or(ErrorCondition::NoConvert)?,
                    ])
                }
            },
            DbrBasicType::Long => match self {
                DbrValue::Char(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Long(_val) => self.clone(),
                DbrValue::Float(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::Double(val) => DbrValue::Long(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Long(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Long(vec![i32::from(*val)]),
            },
            DbrBasicType::Float => match self {
                DbrValue::Char(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::Float(_val) => self.clone(),
                DbrValue::Double(val) => DbrValue::Float(_try_convert_vec(val)?),
                DbrValue::String(val) => DbrValue::Float(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Float(vec![f32::from(*val)]),
            },
            DbrBasicType::Double => match self {
                DbrValue::Char(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Int(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Long(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Float(val) => DbrValue::Double(_try_convert_vec(val)?),
                DbrValue::Double(_val) => self.clone(),
                DbrValue::String(val) => DbrValue::Double(_encode_string(val)?),
                DbrValue::Enum(val) => DbrValue::Double(vec![f64::from(*val)]),
            },
            DbrBasicType::String => match self {
                DbrValue::String(_) => self.clone(),
                DbrValue::Char(val) => DbrValue::String(vec![
                    String::from_utf8(
                        val.iter()
                            .take_while(|c| **c != 0)
                            .map(|c| *c as u8)
                            .collect(),
                    )
                    .map_err(|_| ErrorCondition::NoConvert)?,
                ]),
                DbrValue::Int(val) => DbrValue::String(_format_all(val)),
                DbrValue::Long(val) => DbrValue::String(_format_all(val)),
                DbrValue::Float(val) => DbrValue::String(_format_all(val)),
                DbrValue::Double(val) => DbrValue::String(_format_all(val)),
                // Labels live with the owner of the enum table
                DbrValue::Enum(_) => return Err(ErrorCondition::UnavailInServ),
            },
            DbrBasicType::Enum => match self {
                DbrValue::Enum(_val) => self.clone(),
                DbrValue::Char(val) => match _try_convert_vec::<_, u16>(val)?.as_slice() {
                    [single] => DbrValue::Enum(*single),
                    _ => return Err(ErrorCondition::BadCount),
                },
                DbrValue::Int(val) => match _try_convert_vec::<_, u16>(val)?.as_slice() {
                    [single] => DbrValue::Enum(*single),
                    _ => return Err(ErrorCondition::BadCount),
                },
                DbrValue::Long(val) => match _try_convert_vec::<_, u16>(val)?.as_slice() {
                    [single] => DbrValue::Enum(*single),
                    _ => return Err(ErrorCondition::BadCount),
                },
                _ => return Err(ErrorCondition::NoConvert),
            },
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = if let Some(max_elem) = max_elems {
            cmp::min(max_elem.into(), self.get_count())
        } else {
            self.get_count()
        };

        (
            elements,
            match self {
                DbrValue::Enum(val) => val.to_be_bytes().to_vec(),
                DbrValue::String(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| {
                        let mut buf = string_to_fixed_length_bytes(v, MAX_STRING_SIZE);
                        buf.resize(MAX_STRING_SIZE, 0u8);
                        buf
                    })
                    .collect(),
                DbrValue::Char(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Int(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Long(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Float(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
                DbrValue::Double(val) => val
                    .iter()
                    .take(elements)
                    .flat_map(|v| v.to_be_bytes())
                    .collect(),
            },
        )
    }

    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> Result<DbrValue, DbrDecodeError> {
        Ok(match data_type {
            DbrBasicType::Enum => {
                if item_count == 0 {
                    return Err(DbrDecodeError::Malformed);
                }
                // Only the first index is meaningful for an enum
                DbrValue::Enum(decode(be_u16, data)?.1)
            }
            DbrBasicType::String => {
                if data.len() < item_count * MAX_STRING_SIZE {
                    return Err(DbrDecodeError::Malformed);
                }
                DbrValue::String(
                    data.chunks(MAX_STRING_SIZE)
                        .take(item_count)
                        .map(|d| {
                            let strlen = d.iter().position(|&c| c == 0x00).unwrap_or(d.len());
                            str::from_utf8(&d[0..strlen])
                                .map(|s| s.to_string())
                                .map_err(|_| DbrDecodeError::InvalidString)
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
            DbrBasicType::Char => DbrValue::Char(decode(count(be_i8, item_count), data)?.1),
            DbrBasicType::Int => DbrValue::Int(decode(count(be_i16, item_count), data)?.1),
            DbrBasicType::Long => DbrValue::Long(decode(count(be_i32, item_count), data)?.1),
            DbrBasicType::Float => DbrValue::Float(decode(count(be_f32, item_count), data)?.1),
            DbrBasicType::Double => DbrValue::Double(decode(count(be_f64, item_count), data)?.1),
        })
    }
}

/// Implement a From<datatype> for a specific dbrvalue kind
macro_rules! impl_dbrvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
    };
}
impl_dbrvalue_conversions_between!(Char, i8);
impl_dbrvalue_conversions_between!(Int, i16);
impl_dbrvalue_conversions_between!(Long, i32);
impl_dbrvalue_conversions_between!(Float, f32);
impl_dbrvalue_conversions_between!(Double, f64);
impl_dbrvalue_conversions_between!(String, String);

/// Display, alarm and warning limits, as served in the graphics category
#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub display_limits: (f64, f64),
    pub alarm_limits: (f64, f64),
    pub warning_limits: (f64, f64),
}

impl Limits {
    /// All three pairs set to the same lower/upper bound
    pub fn uniform(low: f64, high: f64) -> Self {
        Limits {
            display_limits: (low, high),
            alarm_limits: (low, high),
            warning_limits: (low, high),
        }
    }
}

/// Metadata carried by the graphics and control categories
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    Enum {
        labels: Vec<String>,
    },
    String,
    Numeric {
        units: String,
        limits: Limits,
        precision: i16,
    },
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}
impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::String as u16 => Ok(Self::String),
            x if x == Self::Int as u16 => Ok(Self::Int),
            x if x == Self::Float as u16 => Ok(Self::Float),
            x if x == Self::Enum as u16 => Ok(Self::Enum),
            x if x == Self::Char as u16 => Ok(Self::Char),
            x if x == Self::Long as u16 => Ok(Self::Long),
            x if x == Self::Double as u16 => Ok(Self::Double),
            _ => Err(()),
        }
    }
}

impl DbrBasicType {
    /// Name used in `DBR_*` text, with `SHORT` for [`DbrBasicType::Int`]
    fn text_name(&self) -> &'static str {
        match self {
            DbrBasicType::String => "STRING",
            DbrBasicType::Int => "SHORT",
            DbrBasicType::Float => "FLOAT",
            DbrBasicType::Enum => "ENUM",
            DbrBasicType::Char => "CHAR",
            DbrBasicType::Long => "LONG",
            DbrBasicType::Double => "DOUBLE",
        }
    }
}

impl fmt::Display for DbrBasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DBR_{}", self.text_name())
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}
impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            x if x == Self::Basic as u16 => Ok(Self::Basic),
            x if x == Self::Status as u16 => Ok(Self::Status),
            x if x == Self::Time as u16 => Ok(Self::Time),
            x if x == Self::Graphics as u16 => Ok(Self::Graphics),
            x if x == Self::Control as u16 => Ok(Self::Control),
            _ => Err(()),
        }
    }
}

/// Represent and translate from ID every combination of `DBR_*_*` the bridge handles
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            value if value < 35 => Ok(Self {
                basic_type: (value % 7).try_into()?,
                category: (value / 7).try_into()?,
            }),
            _ => Err(()),
        }
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl DbrType {
    /// Give the lookup for the padding for each DBR type
    ///
    /// When encoding a return packet, there is a datatype-specific
    /// padding to be inserted between the metadata about the value and
    /// the actual value itself. This is given as a lookup table rather
    /// than a calculations.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Float) => 2,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }
    pub const fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
    /// The TIME variant of a basic type
    pub const fn time(basic_type: DbrBasicType) -> Self {
        Self::new(basic_type, DbrCategory::Time)
    }
}

impl fmt::Display for DbrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = match self.category {
            DbrCategory::Basic => "",
            DbrCategory::Status => "STS_",
            DbrCategory::Time => "TIME_",
            DbrCategory::Graphics => "GR_",
            DbrCategory::Control => "CTRL_",
        };
        write!(f, "DBR_{category}{}", self.basic_type.text_name())
    }
}

/// Represent alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

/// Structured unit of exchange for records in the CA protocol
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status { status: Status, value: DbrValue },
    /// Timestamp, alarm status, and value
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: Status,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    Control {
        status: Status,
        graphics: DbrGraphics,
        control_limits: (f64, f64),
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) => value,
            Dbr::Status { value, .. } => value,
            Dbr::Time { value, .. } => value,
            Dbr::Graphics { value, .. } => value,
            Dbr::Control { value, .. } => value,
        }
    }
    /// If a DBR type encoding alarm status, fetch that
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } => Some(*status),
            Dbr::Time { status, .. } => Some(*status),
            Dbr::Graphics { status, .. } => Some(*status),
            Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
        };
        DbrType::new(self.value().get_type(), category)
    }

    pub fn from_bytes(
        data_type: DbrType,
        data_count: usize,
        data: &[u8],
    ) -> Result<Dbr, DbrDecodeError> {
        if matches!(
            data_type.category,
            DbrCategory::Graphics | DbrCategory::Control
        ) {
            return Err(DbrDecodeError::Unsupported(data_type));
        }

        let (data, status) = if data_type.category != DbrCategory::Basic {
            let (d, (status, severity)) = decode((be_i16, be_i16), data)?;
            (d, Some(Status { status, severity }))
        } else {
            (data, None)
        };

        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (input, (time_s, time_ns)) = decode((be_i32, be_u32), data)?;
            let since_unix = (i64::from(time_s) + POSIX_TIME_AT_EPICS_EPOCH as i64).max(0);
            (
                input,
                UNIX_EPOCH.checked_add(Duration::new(since_unix as u64, time_ns)),
            )
        } else {
            (data, None)
        };

        // Offset the read buffer to account for metadata padding
        let padding = data_type.get_metadata_padding();
        let data = data.get(padding..).ok_or(DbrDecodeError::Malformed)?;
        let value = DbrValue::decode_value(data_type.basic_type, data_count, data)?;

        Ok(match (data_type.category, status) {
            (DbrCategory::Basic, _) => Dbr::Basic(value),
            (DbrCategory::Status, Some(status)) => Dbr::Status { status, value },
            (DbrCategory::Time, Some(status)) => Dbr::Time {
                status,
                timestamp: timestamp.ok_or(DbrDecodeError::Malformed)?,
                value,
            },
            _ => return Err(DbrDecodeError::Unsupported(data_type)),
        })
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> io::Result<(usize, Vec<u8>)> {
        let mut buffer = Cursor::new(Vec::new());
        let real_count = self.write_be(&mut buffer, max_elems)?;
        Ok((real_count, buffer.into_inner()))
    }

    /// Write a requested number of elements to a stream
    ///
    /// Return the actual number of elements written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        if matches!(self, Dbr::Graphics { .. } | Dbr::Control { .. }) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("Cannot encode {} records", self.data_type()),
            ));
        }
        let (real_elems, data) = self.value().to_bytes(max_elems);
        // All except Basic write status/severity
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        if let Dbr::Time { timestamp, .. } = self {
            let unix_time = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
            let time_s = (unix_time.as_secs() as i64 - POSIX_TIME_AT_EPICS_EPOCH as i64) as i32;
            let time_ns = unix_time.subsec_nanos();
            writer.write_all(&time_s.to_be_bytes())?;
            writer.write_all(&time_ns.to_be_bytes())?;
        }

        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(real_elems)
    }

    /// Convert to another type and category
    ///
    /// Metadata missing from the source (status, timestamp) is filled with defaults
    /// and the current time. Graphics and control records cannot be synthesised here
    /// because their contents belong to whoever owns the value.
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, ErrorCondition> {
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        let timestamp = self.timestamp().unwrap_or_else(SystemTime::now);
        Ok(match (self, dbr_type.category) {
            (_, DbrCategory::Basic) => Dbr::Basic(value),
            (_, DbrCategory::Status) => Dbr::Status { status, value },
            (_, DbrCategory::Time) => Dbr::Time {
                status,
                timestamp,
                value,
            },
            (Dbr::Graphics { graphics, .. }, DbrCategory::Graphics) => Dbr::Graphics {
                status,
                graphics: graphics.clone(),
                value,
            },
            (
                Dbr::Control {
                    graphics,
                    control_limits,
                    ..
                },
                DbrCategory::Control,
            ) => Dbr::Control {
                status,
                graphics: graphics.clone(),
                control_limits: *control_limits,
                value,
            },
            _ => return Err(ErrorCondition::NoConvert),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_or_vec() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.to_bytes(NonZeroUsize::new(1)).1,
            data.iter()
                .take(1)
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        // Try converting this to an int with truncation
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v.to_bytes(None).1, vec![0x01, 0xf4, 0x00, 0x0c]);
    }

    #[test]
    fn encode_dbr() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_secs(1741731609))
                .unwrap(),
            value: vec![42i32].into(),
        };

        let (_size, out_data) = dbr
            .convert_to(DbrType::time(DbrBasicType::Long))
            .unwrap()
            .to_bytes(None)
            .unwrap();
        assert_eq!(out_data, example_packet);

        let decoded = Dbr::from_bytes(DbrType::time(DbrBasicType::Long), 1, &out_data).unwrap();
        assert_eq!(decoded, dbr);
    }

    #[test]
    fn time_string_padding_and_decoding() {
        let dbr = Dbr::Time {
            status: Status {
                status: 3,
                severity: 2,
            },
            timestamp: UNIX_EPOCH + Duration::new(POSIX_TIME_AT_EPICS_EPOCH + 10, 500),
            value: DbrValue::String(vec!["On".to_string()]),
        };
        let (count, bytes) = dbr.to_bytes(None).unwrap();
        assert_eq!(count, 1);
        assert_eq!(bytes.len(), 12 + MAX_STRING_SIZE);
        assert_eq!(&bytes[4..8], &10i32.to_be_bytes());
        let back = Dbr::from_bytes(DbrType::time(DbrBasicType::String), 1, &bytes).unwrap();
        assert_eq!(back, dbr);
    }

    #[test]
    fn truncated_buffers_are_errors() {
        assert!(matches!(
            Dbr::from_bytes(DbrType::time(DbrBasicType::Double), 1, &[0u8; 10]),
            Err(DbrDecodeError::Malformed)
        ));
        assert!(DbrValue::decode_value(DbrBasicType::String, 1, &[b'a'; 12]).is_err());
        assert!(matches!(
            Dbr::from_bytes(
                DbrType::new(DbrBasicType::Double, DbrCategory::Graphics),
                1,
                &[0u8; 64]
            ),
            Err(DbrDecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_string_to_char() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn enum_conversions() {
        assert_eq!(
            DbrValue::Int(vec![3]).convert_to(DbrBasicType::Enum).unwrap(),
            DbrValue::Enum(3)
        );
        assert!(DbrValue::Int(vec![-1]).convert_to(DbrBasicType::Enum).is_err());
        assert_eq!(
            DbrValue::Enum(7).convert_to(DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![7.0])
        );
        assert_eq!(
            DbrValue::Enum(7).convert_to(DbrBasicType::String),
            Err(ErrorCondition::UnavailInServ)
        );
        assert_eq!(
            DbrValue::String(vec![" 4".to_string()])
                .parse_into(DbrBasicType::Enum)
                .unwrap(),
            DbrValue::Enum(4)
        );
    }

    #[test]
    fn type_codes_and_names() {
        assert_eq!(
            DbrType::time(DbrBasicType::Enum).to_string(),
            "DBR_TIME_ENUM"
        );
        assert_eq!(
            DbrType::new(DbrBasicType::Double, DbrCategory::Graphics).to_string(),
            "DBR_GR_DOUBLE"
        );
        assert_eq!(DbrBasicType::Int.to_string(), "DBR_SHORT");
        assert_eq!(u16::from(DbrType::time(DbrBasicType::Double)), 20);
        for code in 0..35u16 {
            let dbr_type = DbrType::try_from(code).unwrap();
            assert_eq!(u16::from(dbr_type), code);
        }
        assert!(DbrType::try_from(35).is_err());
    }
}
