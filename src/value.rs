//! Host-side values, and marshaling them to and from CA buffers
//!
//! Callbacks and scripting-facing operations see [`Value`], a small dynamic value
//! type. The protocol layer sees raw DBR buffers. [`wire_to_host`] and
//! [`host_to_wire`] are the two directions; both are pure functions so they can run
//! on whichever thread the protocol layer calls back on.

use std::{
    collections::BTreeMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    dbr::{
        Dbr, DbrBasicType, DbrDecodeError, DbrType, DbrValue, MAX_ENUM_STRING_SIZE,
        MAX_STRING_SIZE, Status,
    },
    messages::ErrorCondition,
};

/// A dynamically typed value as seen by the scripting host
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

/// A value could not be converted to the representation a target needs
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("expected integer but got \"{0}\"")]
    NotAnInteger(String),
    #[error("expected floating-point number but got \"{0}\"")]
    NotANumber(String),
    #[error("Value outside range for type {type_name}")]
    OutOfRange { value: i64, type_name: String },
    #[error("Value outside range for type {type_name}")]
    FloatOutOfRange { value: f64, type_name: String },
    #[error("String too long for enum")]
    EnumLabelTooLong,
    #[error("String too long, must be at most {max} bytes")]
    StringTooLong { max: usize },
    #[error("Invalid enum state \"{0}\"")]
    InvalidEnumState(String),
    #[error("Enum index {0} out of range, must be below 16")]
    EnumIndexOutOfRange(i64),
    #[error("Vector put not implemented")]
    VectorPut,
    #[error("Unsupported data type {0}")]
    UnsupportedType(String),
    #[error("{0}")]
    Decode(#[from] DbrDecodeError),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Empty => true,
            Value::String(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Dict(d) => d.is_empty(),
            _ => false,
        }
    }

    /// Interpret as a 64-bit integer; text is parsed, floating-point is refused
    pub fn as_wide_int(&self) -> Result<i64, ConversionError> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Bool(b) => Ok(i64::from(*b)),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| ConversionError::NotAnInteger(s.clone())),
            other => Err(ConversionError::NotAnInteger(other.to_string())),
        }
    }

    pub fn as_double(&self) -> Result<f64, ConversionError> {
        match self {
            Value::Int(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::Bool(b) => Ok(f64::from(u8::from(*b))),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| ConversionError::NotANumber(s.clone())),
            other => Err(ConversionError::NotANumber(other.to_string())),
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => Ok(()),
            Value::Bool(b) => write!(f, "{}", u8::from(*b)),
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Value::Dict(map) => {
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{k} {{{v}}}")?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! impl_value_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(value: $t) -> Self {
                Value::Int(i64::from(value))
            }
        })*
    };
}
impl_value_from_integer!(i8, u8, i16, u16, i32, u32, i64);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}
impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Double(f64::from(value))
    }
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

/// Status, severity and timestamp accompanying a get or monitor result
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    pub status: Option<i16>,
    pub severity: Option<i16>,
    /// Seconds since the UNIX epoch, with nanosecond fraction
    pub time: Option<f64>,
    /// Outcome of the request that produced this result
    pub request_status: ErrorCondition,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            status: None,
            severity: None,
            time: None,
            request_status: ErrorCondition::Normal,
        }
    }
}

impl Metadata {
    /// Metadata for a request that failed, with no record attached
    pub fn failed(request_status: ErrorCondition) -> Self {
        Metadata {
            request_status,
            ..Default::default()
        }
    }

    fn from_record(status: Option<Status>, timestamp: Option<SystemTime>) -> Self {
        Metadata {
            status: status.map(|s| s.status),
            severity: status.map(|s| s.severity),
            time: timestamp.map(|t| {
                t.duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default()
            }),
            request_status: ErrorCondition::Normal,
        }
    }

    pub fn message(&self) -> String {
        self.request_status.message()
    }

    /// The mapping handed to scripts: status, severity, time, reqstatus, message
    ///
    /// Entries that the record did not carry are present but empty.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "status".to_string(),
            self.status.map(Value::from).unwrap_or_default(),
        );
        map.insert(
            "severity".to_string(),
            self.severity.map(Value::from).unwrap_or_default(),
        );
        map.insert(
            "time".to_string(),
            self.time.map(Value::from).unwrap_or_default(),
        );
        map.insert(
            "reqstatus".to_string(),
            Value::from(self.request_status.code()),
        );
        map.insert("message".to_string(), Value::from(self.message()));
        Value::Dict(map)
    }
}

impl From<Metadata> for Value {
    fn from(value: Metadata) -> Self {
        value.to_value()
    }
}

/// Convert a decoded DBR value into the host representation
///
/// Single elements become scalars; arrays become lists.
pub fn dbr_value_to_host(value: &DbrValue) -> Value {
    fn _collect<T: Copy + Into<Value>>(items: &[T]) -> Value {
        match items {
            [single] => (*single).into(),
            many => Value::List(many.iter().map(|v| (*v).into()).collect()),
        }
    }
    match value {
        DbrValue::Enum(index) => Value::from(*index),
        DbrValue::String(items) => match items.as_slice() {
            [single] => Value::String(single.clone()),
            many => Value::List(many.iter().map(|s| Value::from(s.as_str())).collect()),
        },
        DbrValue::Char(items) => _collect(items),
        DbrValue::Int(items) => _collect(items),
        DbrValue::Long(items) => _collect(items),
        DbrValue::Float(items) => _collect(items),
        DbrValue::Double(items) => _collect(items),
    }
}

/// Decode a raw buffer from the protocol layer into a host value and its metadata
pub fn wire_to_host(
    dbr_type: DbrType,
    data: &[u8],
    count: usize,
) -> Result<(Value, Metadata), ConversionError> {
    let dbr = Dbr::from_bytes(dbr_type, count, data)?;
    let metadata = Metadata::from_record(dbr.status(), dbr.timestamp());
    Ok((dbr_value_to_host(dbr.value()), metadata))
}

/// Narrow a double to single precision, refusing finite values that would overflow
pub(crate) fn narrow_to_f32(value: f64, type_name: &str) -> Result<f32, ConversionError> {
    let narrowed = value as f32;
    if value.is_finite() && narrowed.is_infinite() {
        return Err(ConversionError::FloatOutOfRange {
            value,
            type_name: type_name.to_string(),
        });
    }
    Ok(narrowed)
}

/// Check an integer fits a narrower type exactly
fn narrow<T>(value: i64, basic_type: DbrBasicType) -> Result<T, ConversionError>
where
    T: TryFrom<i64>,
{
    T::try_from(value).map_err(|_| ConversionError::OutOfRange {
        value,
        type_name: basic_type.to_string(),
    })
}

/// Convert a host value into the value a put to a `native` channel should carry
///
/// Enumerated channels accept either an index or a label; a label is sent as a
/// string for the server to resolve.
pub fn host_to_dbr_value(
    value: &Value,
    native: DbrBasicType,
    count: usize,
) -> Result<DbrValue, ConversionError> {
    if count != 1 {
        return Err(ConversionError::VectorPut);
    }
    Ok(match native {
        DbrBasicType::Char => DbrValue::Char(vec![narrow(value.as_wide_int()?, native)?]),
        DbrBasicType::Int => DbrValue::Int(vec![narrow(value.as_wide_int()?, native)?]),
        DbrBasicType::Long => DbrValue::Long(vec![narrow(value.as_wide_int()?, native)?]),
        DbrBasicType::Float => DbrValue::Float(vec![narrow_to_f32(
            value.as_double()?,
            &native.to_string(),
        )?]),
        DbrBasicType::Double => DbrValue::Double(vec![value.as_double()?]),
        DbrBasicType::Enum => match value.as_wide_int() {
            Ok(index) => DbrValue::Enum(narrow(index, native)?),
            Err(_) => {
                let label = value.to_string();
                if label.len() + 1 > MAX_ENUM_STRING_SIZE {
                    return Err(ConversionError::EnumLabelTooLong);
                }
                DbrValue::String(vec![label])
            }
        },
        DbrBasicType::String => {
            let text = value.to_string();
            if text.len() + 1 > MAX_STRING_SIZE {
                return Err(ConversionError::StringTooLong {
                    max: MAX_STRING_SIZE - 1,
                });
            }
            DbrValue::String(vec![text])
        }
    })
}

/// Encode a host value as an outgoing TIME record stamped with the current time
///
/// Returns the record type actually used, the element count, and the raw buffer.
pub fn host_to_wire(
    value: &Value,
    native: DbrBasicType,
    count: usize,
) -> Result<(DbrType, usize, Vec<u8>), ConversionError> {
    let value = host_to_dbr_value(value, native, count)?;
    let record = Dbr::Time {
        status: Status::default(),
        timestamp: SystemTime::now(),
        value,
    };
    let dbr_type = record.data_type();
    let (count, data) = record
        .to_bytes(None)
        .map_err(|e| ConversionError::UnsupportedType(e.to_string()))?;
    Ok((dbr_type, count, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn integers_are_range_checked() {
        assert_eq!(
            host_to_dbr_value(&Value::Int(127), DbrBasicType::Char, 1).unwrap(),
            DbrValue::Char(vec![127])
        );
        let err = host_to_dbr_value(&Value::Int(300), DbrBasicType::Char, 1).unwrap_err();
        assert_eq!(err.to_string(), "Value outside range for type DBR_CHAR");
        assert!(host_to_dbr_value(&Value::Int(-40000), DbrBasicType::Int, 1).is_err());
        assert!(host_to_dbr_value(&Value::Int(1 << 31), DbrBasicType::Long, 1).is_err());
        assert_eq!(
            host_to_dbr_value(&Value::from("-12"), DbrBasicType::Long, 1).unwrap(),
            DbrValue::Long(vec![-12])
        );
        assert!(matches!(
            host_to_dbr_value(&Value::Double(1.5), DbrBasicType::Int, 1),
            Err(ConversionError::NotAnInteger(_))
        ));
    }

    #[test]
    fn floats_that_overflow_single_precision_are_refused() {
        assert_eq!(
            host_to_dbr_value(&Value::Double(1.5), DbrBasicType::Float, 1).unwrap(),
            DbrValue::Float(vec![1.5])
        );
        let err = host_to_dbr_value(&Value::Double(1e39), DbrBasicType::Float, 1).unwrap_err();
        assert!(matches!(err, ConversionError::FloatOutOfRange { .. }));
        assert_eq!(err.to_string(), "Value outside range for type DBR_FLOAT");
        assert!(host_to_dbr_value(&Value::Double(-1e300), DbrBasicType::Float, 1).is_err());
        // Infinities were never finite, so they pass through
        assert_eq!(
            host_to_dbr_value(&Value::Double(f64::INFINITY), DbrBasicType::Float, 1).unwrap(),
            DbrValue::Float(vec![f32::INFINITY])
        );
    }

    #[test]
    fn enum_puts_accept_index_or_label() {
        assert_eq!(
            host_to_dbr_value(&Value::Int(1), DbrBasicType::Enum, 1).unwrap(),
            DbrValue::Enum(1)
        );
        assert_eq!(
            host_to_dbr_value(&Value::from("On"), DbrBasicType::Enum, 1).unwrap(),
            DbrValue::String(vec!["On".to_string()])
        );
        assert_eq!(
            host_to_dbr_value(&Value::from("x".repeat(26)), DbrBasicType::Enum, 1)
                .unwrap_err(),
            ConversionError::EnumLabelTooLong
        );
        assert!(host_to_dbr_value(&Value::Int(70000), DbrBasicType::Enum, 1).is_err());
    }

    #[test]
    fn vectors_and_long_strings_are_refused() {
        assert_eq!(
            host_to_dbr_value(&Value::Int(1), DbrBasicType::Long, 3).unwrap_err(),
            ConversionError::VectorPut
        );
        assert!(host_to_dbr_value(&Value::from("a".repeat(40)), DbrBasicType::String, 1).is_err());
        assert!(host_to_dbr_value(&Value::from("a".repeat(39)), DbrBasicType::String, 1).is_ok());
    }

    #[test]
    fn put_records_are_stamped_now() {
        let before = SystemTime::now();
        let (dbr_type, count, data) =
            host_to_wire(&Value::Double(3.5), DbrBasicType::Double, 1).unwrap();
        assert_eq!(dbr_type, DbrType::time(DbrBasicType::Double));
        assert_eq!(count, 1);
        let (value, metadata) = wire_to_host(dbr_type, &data, count).unwrap();
        assert_eq!(value, Value::Double(3.5));
        let stamped = UNIX_EPOCH + Duration::from_secs_f64(metadata.time.unwrap());
        // Encoding keeps whole nanoseconds, so allow a little slack
        assert!(stamped + Duration::from_millis(1) >= before);
    }

    #[test]
    fn arrays_become_lists() {
        let record = Dbr::Time {
            status: Status {
                status: 0,
                severity: 1,
            },
            timestamp: UNIX_EPOCH + Duration::from_secs(1_000_000_000),
            value: DbrValue::Long(vec![1, 2, 3]),
        };
        let (count, data) = record.to_bytes(None).unwrap();
        let (value, metadata) = wire_to_host(record.data_type(), &data, count).unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(metadata.severity, Some(1));
        assert_eq!(metadata.time, Some(1_000_000_000.0));
    }

    #[test]
    fn metadata_mapping_keys() {
        let metadata = Metadata::failed(ErrorCondition::Disconn);
        let value = metadata.to_value();
        let map = value.as_dict().unwrap();
        assert_eq!(map["status"], Value::Empty);
        assert_eq!(map["reqstatus"], Value::Int(192));
        assert_eq!(
            map["message"],
            Value::from("Virtual circuit disconnect")
        );
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn host_value_interpretation() {
        assert_eq!(Value::from(" 42 ").as_wide_int(), Ok(42));
        assert_eq!(Value::Bool(true).as_double(), Ok(1.0));
        assert!(Value::List(vec![]).as_double().is_err());
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::from("a")]).to_string(),
            "1 a"
        );
        assert!(Value::from("").is_empty());
    }
}
