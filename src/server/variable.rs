use std::{
    collections::HashSet,
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use tracing::{debug, debug_span, trace};

use crate::{
    callback::{ReadCallback, WriteCallback},
    dbr::{
        Dbr, DbrBasicType, DbrCategory, DbrGraphics, DbrType, DbrValue, Limits,
        MAX_ENUM_STATES, MAX_ENUM_STRING_SIZE, MAX_STRING_SIZE, MAX_UNITS_SIZE, Status,
    },
    messages::{ErrorCondition, MonitorMask},
    provider::AsyncIoCompleter,
    server::{
        ServerError, ServerShared,
        async_io::{Handshake, IoKind},
    },
    value::{ConversionError, Value, narrow_to_f32},
};

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a published variable
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(u64);

impl VariableId {
    fn next() -> Self {
        VariableId(NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var{}", self.0)
    }
}

/// Element type of a published variable
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ScalarType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float,
    #[default]
    Double,
    Enum,
    String,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarType::Int8 => "int8",
            ScalarType::Uint8 => "uint8",
            ScalarType::Int16 => "int16",
            ScalarType::Uint16 => "uint16",
            ScalarType::Int32 => "int32",
            ScalarType::Uint32 => "uint32",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::Enum => "enum",
            ScalarType::String => "string",
        }
    }

    /// The CA type clients see; the narrowest one holding every value
    pub fn native_type(&self) -> DbrBasicType {
        match self {
            ScalarType::Int8 => DbrBasicType::Char,
            ScalarType::Uint8 => DbrBasicType::Int,
            ScalarType::Int16 => DbrBasicType::Int,
            ScalarType::Uint16 => DbrBasicType::Long,
            ScalarType::Int32 => DbrBasicType::Long,
            ScalarType::Uint32 => DbrBasicType::Double,
            ScalarType::Float => DbrBasicType::Float,
            ScalarType::Double => DbrBasicType::Double,
            ScalarType::Enum => DbrBasicType::Enum,
            ScalarType::String => DbrBasicType::String,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScalarType {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "int8" => ScalarType::Int8,
            "uint8" => ScalarType::Uint8,
            "int16" => ScalarType::Int16,
            "uint16" => ScalarType::Uint16,
            "int32" => ScalarType::Int32,
            "uint32" => ScalarType::Uint32,
            "float" => ScalarType::Float,
            "double" => ScalarType::Double,
            "enum" => ScalarType::Enum,
            "string" => ScalarType::String,
            _ => return Err(ServerError::UnknownType(s.to_string())),
        })
    }
}

/// Storage of a published variable; its variant never changes after creation
#[derive(Debug, Clone, PartialEq)]
pub enum PvData {
    Int8(Vec<i8>),
    Uint8(Vec<u8>),
    Int16(Vec<i16>),
    Uint16(Vec<u16>),
    Int32(Vec<i32>),
    Uint32(Vec<u32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Enum(Vec<u16>),
    String(Vec<String>),
}

fn label_of(labels: &[String], index: u16) -> String {
    labels
        .get(usize::from(index))
        .cloned()
        .unwrap_or_else(|| index.to_string())
}

/// Resolve an enum state written as a label or an index
fn enum_index_from_text(text: &str, labels: &[String]) -> Result<u16, ConversionError> {
    if let Some(index) = labels.iter().position(|l| l == text) {
        return Ok(index as u16);
    }
    if let Ok(index) = text.trim().parse::<i64>() {
        return enum_index_from_int(index);
    }
    if text.len() + 1 > MAX_ENUM_STRING_SIZE {
        return Err(ConversionError::EnumLabelTooLong);
    }
    Err(ConversionError::InvalidEnumState(text.to_string()))
}

fn enum_index_from_int(index: i64) -> Result<u16, ConversionError> {
    if (0..MAX_ENUM_STATES as i64).contains(&index) {
        Ok(index as u16)
    } else {
        Err(ConversionError::EnumIndexOutOfRange(index))
    }
}

impl PvData {
    pub fn zeroed(scalar_type: ScalarType, count: usize) -> Self {
        match scalar_type {
            ScalarType::Int8 => PvData::Int8(vec![0; count]),
            ScalarType::Uint8 => PvData::Uint8(vec![0; count]),
            ScalarType::Int16 => PvData::Int16(vec![0; count]),
            ScalarType::Uint16 => PvData::Uint16(vec![0; count]),
            ScalarType::Int32 => PvData::Int32(vec![0; count]),
            ScalarType::Uint32 => PvData::Uint32(vec![0; count]),
            ScalarType::Float => PvData::Float(vec![0.0; count]),
            ScalarType::Double => PvData::Double(vec![0.0; count]),
            ScalarType::Enum => PvData::Enum(vec![0; count]),
            ScalarType::String => PvData::String(vec![String::new(); count]),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            PvData::Int8(_) => ScalarType::Int8,
            PvData::Uint8(_) => ScalarType::Uint8,
            PvData::Int16(_) => ScalarType::Int16,
            PvData::Uint16(_) => ScalarType::Uint16,
            PvData::Int32(_) => ScalarType::Int32,
            PvData::Uint32(_) => ScalarType::Uint32,
            PvData::Float(_) => ScalarType::Float,
            PvData::Double(_) => ScalarType::Double,
            PvData::Enum(_) => ScalarType::Enum,
            PvData::String(_) => ScalarType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PvData::Int8(v) => v.len(),
            PvData::Uint8(v) => v.len(),
            PvData::Int16(v) => v.len(),
            PvData::Uint16(v) => v.len(),
            PvData::Int32(v) => v.len(),
            PvData::Uint32(v) => v.len(),
            PvData::Float(v) => v.len(),
            PvData::Double(v) => v.len(),
            PvData::Enum(v) => v.len(),
            PvData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host representation: a scalar for one element, otherwise a list
    pub fn to_host(&self) -> Value {
        fn _host<T: Copy + Into<Value>>(items: &[T]) -> Value {
            match items {
                [single] => (*single).into(),
                many => Value::List(many.iter().map(|v| (*v).into()).collect()),
            }
        }
        match self {
            PvData::Int8(v) => _host(v),
            PvData::Uint8(v) => _host(v),
            PvData::Int16(v) => _host(v),
            PvData::Uint16(v) => _host(v),
            PvData::Int32(v) => _host(v),
            PvData::Uint32(v) => _host(v),
            PvData::Float(v) => _host(v),
            PvData::Double(v) => _host(v),
            PvData::Enum(v) => _host(v),
            PvData::String(v) => match v.as_slice() {
                [single] => Value::String(single.clone()),
                many => Value::List(many.iter().map(|s| Value::from(s.as_str())).collect()),
            },
        }
    }

    /// The value as sent to clients, in the native CA type
    pub fn to_dbr_value(&self) -> DbrValue {
        fn _widen<T: Copy, U: From<T>>(items: &[T]) -> Vec<U> {
            items.iter().map(|v| U::from(*v)).collect()
        }
        match self {
            PvData::Int8(v) => DbrValue::Char(v.clone()),
            PvData::Uint8(v) => DbrValue::Int(_widen(v)),
            PvData::Int16(v) => DbrValue::Int(v.clone()),
            PvData::Uint16(v) => DbrValue::Long(_widen(v)),
            PvData::Int32(v) => DbrValue::Long(v.clone()),
            PvData::Uint32(v) => DbrValue::Double(_widen(v)),
            PvData::Float(v) => DbrValue::Float(v.clone()),
            PvData::Double(v) => DbrValue::Double(v.clone()),
            PvData::Enum(v) => DbrValue::Enum(v.first().copied().unwrap_or_default()),
            PvData::String(v) => DbrValue::String(v.clone()),
        }
    }

    /// Convert a host value, exactly, to storage of `scalar_type`
    ///
    /// Lists convert element by element.
    pub fn from_host(
        scalar_type: ScalarType,
        value: &Value,
        labels: &[String],
    ) -> Result<PvData, ConversionError> {
        let items: Vec<&Value> = match value {
            Value::List(items) => items.iter().collect(),
            single => vec![single],
        };
        fn _ints<T: TryFrom<i64>>(
            items: &[&Value],
            scalar_type: ScalarType,
        ) -> Result<Vec<T>, ConversionError> {
            items
                .iter()
                .map(|item| {
                    let value = item.as_wide_int()?;
                    T::try_from(value).map_err(|_| ConversionError::OutOfRange {
                        value,
                        type_name: scalar_type.to_string(),
                    })
                })
                .collect()
        }
        Ok(match scalar_type {
            ScalarType::Int8 => PvData::Int8(_ints(&items, scalar_type)?),
            ScalarType::Uint8 => PvData::Uint8(_ints(&items, scalar_type)?),
            ScalarType::Int16 => PvData::Int16(_ints(&items, scalar_type)?),
            ScalarType::Uint16 => PvData::Uint16(_ints(&items, scalar_type)?),
            ScalarType::Int32 => PvData::Int32(_ints(&items, scalar_type)?),
            ScalarType::Uint32 => PvData::Uint32(_ints(&items, scalar_type)?),
            ScalarType::Float => PvData::Float(
                items
                    .iter()
                    .map(|v| narrow_to_f32(v.as_double()?, scalar_type.name()))
                    .collect::<Result<_, _>>()?,
            ),
            ScalarType::Double => PvData::Double(
                items
                    .iter()
                    .map(|v| v.as_double())
                    .collect::<Result<_, _>>()?,
            ),
            ScalarType::Enum => PvData::Enum(
                items
                    .iter()
                    .map(|v| match v {
                        Value::Int(index) => enum_index_from_int(*index),
                        other => enum_index_from_text(&other.to_string(), labels),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            ScalarType::String => PvData::String(
                items
                    .iter()
                    .map(|v| {
                        let text = v.to_string();
                        if text.len() + 1 > MAX_STRING_SIZE {
                            Err(ConversionError::StringTooLong {
                                max: MAX_STRING_SIZE - 1,
                            })
                        } else {
                            Ok(text)
                        }
                    })
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Convert a value written by a client to storage of `scalar_type`
    pub fn from_dbr_value(
        scalar_type: ScalarType,
        value: &DbrValue,
        labels: &[String],
    ) -> Result<PvData, ErrorCondition> {
        fn _cast<T: num::NumCast, U: num::NumCast + Copy>(
            items: &[U],
        ) -> Result<Vec<T>, ErrorCondition> {
            items
                .iter()
                .map(|v| num::NumCast::from(*v).ok_or(ErrorCondition::NoConvert))
                .collect()
        }
        let native = scalar_type.native_type();
        let wire = match (scalar_type, value) {
            (ScalarType::Enum, DbrValue::String(texts)) => {
                return Ok(PvData::Enum(
                    texts
                        .iter()
                        .map(|t| enum_index_from_text(t, labels))
                        .collect::<Result<_, _>>()
                        .map_err(|_| ErrorCondition::NoConvert)?,
                ));
            }
            (ScalarType::String, _) if !matches!(value, DbrValue::String(_)) => match value {
                DbrValue::Enum(index) => DbrValue::String(vec![label_of(labels, *index)]),
                other => other.convert_to(DbrBasicType::String)?,
            },
            (_, DbrValue::String(_)) => value
                .parse_into(native)
                .map_err(|_| ErrorCondition::NoConvert)?,
            _ => value.convert_to(native)?,
        };
        Ok(match (scalar_type, &wire) {
            (ScalarType::Int8, DbrValue::Char(v)) => PvData::Int8(v.clone()),
            (ScalarType::Uint8, DbrValue::Int(v)) => PvData::Uint8(_cast(v)?),
            (ScalarType::Int16, DbrValue::Int(v)) => PvData::Int16(v.clone()),
            (ScalarType::Uint16, DbrValue::Long(v)) => PvData::Uint16(_cast(v)?),
            (ScalarType::Int32, DbrValue::Long(v)) => PvData::Int32(v.clone()),
            (ScalarType::Uint32, DbrValue::Double(v)) => PvData::Uint32(_cast(v)?),
            (ScalarType::Float, DbrValue::Float(v)) => PvData::Float(v.clone()),
            (ScalarType::Double, DbrValue::Double(v)) => PvData::Double(v.clone()),
            (ScalarType::Enum, DbrValue::Enum(index)) => PvData::Enum(vec![
                enum_index_from_int(i64::from(*index)).map_err(|_| ErrorCondition::NoConvert)?,
            ]),
            (ScalarType::String, DbrValue::String(v)) => PvData::String(v.clone()),
            _ => return Err(ErrorCondition::NoConvert),
        })
    }

    /// The value in a requested CA type; enum states become labels as strings
    fn as_dbr_value(
        &self,
        labels: &[String],
        basic_type: DbrBasicType,
    ) -> Result<DbrValue, ErrorCondition> {
        match (self, basic_type) {
            (PvData::Enum(indices), DbrBasicType::String) => Ok(DbrValue::String(
                indices.iter().map(|i| label_of(labels, *i)).collect(),
            )),
            _ => self.to_dbr_value().convert_to(basic_type),
        }
    }
}

/// Display properties served with graphics and control records
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayProperties {
    pub low_limit: f64,
    pub high_limit: f64,
    pub precision: u16,
    pub units: String,
}

impl Default for DisplayProperties {
    fn default() -> Self {
        DisplayProperties {
            low_limit: 0.0,
            high_limit: 10.0,
            precision: 6,
            units: String::new(),
        }
    }
}

struct VariableState {
    data: PvData,
    timestamp: SystemTime,
    display: DisplayProperties,
    enum_labels: Vec<String>,
    on_read: Option<ReadCallback>,
    on_write: Option<WriteCallback>,
    /// Deferred requests that may still need canceling
    outstanding: Vec<Weak<Handshake>>,
    destroyed: bool,
}

impl VariableState {
    /// Build a full record of `data` in the requested type and category
    fn record(
        &self,
        data: &PvData,
        timestamp: SystemTime,
        requested: DbrType,
    ) -> Result<Dbr, ErrorCondition> {
        let value = data.as_dbr_value(&self.enum_labels, requested.basic_type)?;
        let status = Status::default();
        let graphics = || match requested.basic_type {
            DbrBasicType::Enum => DbrGraphics::Enum {
                labels: self.enum_labels.clone(),
            },
            DbrBasicType::String => DbrGraphics::String,
            _ => DbrGraphics::Numeric {
                units: self.display.units.clone(),
                limits: Limits::uniform(self.display.low_limit, self.display.high_limit),
                precision: i16::try_from(self.display.precision).unwrap_or(i16::MAX),
            },
        };
        Ok(match requested.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics: graphics(),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics: graphics(),
                control_limits: (self.display.low_limit, self.display.high_limit),
                value,
            },
        })
    }
}

pub(crate) struct VariableShared {
    id: VariableId,
    name: String,
    scalar_type: ScalarType,
    count: usize,
    state: Mutex<VariableState>,
    server: Weak<ServerShared>,
}

/// A published variable
///
/// Handles are cheap to clone and may be used from any thread; every clone refers to
/// the same variable.
#[derive(Clone)]
pub struct Variable {
    shared: Arc<VariableShared>,
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}
impl Eq for Variable {}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("type", &self.shared.scalar_type)
            .field("count", &self.shared.count)
            .finish()
    }
}

impl Variable {
    pub(crate) fn new(
        name: &str,
        scalar_type: ScalarType,
        count: usize,
        server: Weak<ServerShared>,
    ) -> Self {
        Variable {
            shared: Arc::new(VariableShared {
                id: VariableId::next(),
                name: name.to_string(),
                scalar_type,
                count,
                state: Mutex::new(VariableState {
                    data: PvData::zeroed(scalar_type, count),
                    timestamp: SystemTime::now(),
                    display: DisplayProperties::default(),
                    enum_labels: Vec::new(),
                    on_read: None,
                    on_write: None,
                    outstanding: Vec::new(),
                    destroyed: false,
                }),
                server,
            }),
        }
    }

    pub fn id(&self) -> VariableId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.shared.scalar_type
    }

    pub fn count(&self) -> usize {
        self.shared.count
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().unwrap().destroyed
    }

    /// The current value; enum variables read as their state index
    pub fn read(&self) -> Value {
        self.shared.state.lock().unwrap().data.to_host()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.shared.state.lock().unwrap().timestamp
    }

    /// Store a new value and notify subscribed clients
    pub fn write(&self, value: &Value) -> Result<(), ServerError> {
        if self.shared.count != 1 {
            return Err(ServerError::VectorWrite(self.shared.count));
        }
        let data = {
            let state = self.shared.state.lock().unwrap();
            if state.destroyed {
                return Err(ServerError::Destroyed(self.shared.name.clone()));
            }
            PvData::from_host(self.shared.scalar_type, value, &state.enum_labels)?
        };
        self.store(data);
        Ok(())
    }

    /// Replace the stored value, stamp it, and post a value change
    pub(crate) fn store(&self, data: PvData) {
        let record = {
            let mut state = self.shared.state.lock().unwrap();
            state.data = data;
            state.timestamp = SystemTime::now();
            Dbr::Time {
                status: Status::default(),
                timestamp: state.timestamp,
                value: state.data.to_dbr_value(),
            }
        };
        trace!("{} = {:?}", self.shared.name, record.value());
        if let Some(server) = self.shared.server.upgrade() {
            server.post_value_change(&self.shared.name, MonitorMask::VALUE_LOG, record);
        }
    }

    /// Convert a client's write to storage, without storing it
    pub(crate) fn convert_incoming(&self, incoming: &DbrValue) -> Result<PvData, ServerError> {
        let state = self.shared.state.lock().unwrap();
        let data = PvData::from_dbr_value(self.shared.scalar_type, incoming, &state.enum_labels)?;
        if data.len() != self.shared.count {
            return Err(ServerError::Protocol(ErrorCondition::BadCount));
        }
        Ok(data)
    }

    /// Serve a read from the stored value
    pub(crate) fn current_record(&self, requested: DbrType) -> Result<Dbr, ErrorCondition> {
        let state = self.shared.state.lock().unwrap();
        state.record(&state.data, state.timestamp, requested)
    }

    /// Serve a deferred read with a host-supplied value, leaving the variable alone
    pub(crate) fn reply_with(&self, value: &Value, requested: DbrType) -> Result<Dbr, ServerError> {
        let state = self.shared.state.lock().unwrap();
        let data = PvData::from_host(self.shared.scalar_type, value, &state.enum_labels)?;
        Ok(state.record(&data, SystemTime::now(), requested)?)
    }

    /// Convert a posted value change for a subscriber
    pub(crate) fn convert_posted(&self, posted: &Dbr, requested: DbrType) -> Result<Dbr, ErrorCondition> {
        let state = self.shared.state.lock().unwrap();
        match (posted.value(), requested.basic_type, requested.category) {
            (_, _, DbrCategory::Graphics | DbrCategory::Control) => {
                state.record(&state.data, state.timestamp, requested)
            }
            (DbrValue::Enum(index), DbrBasicType::String, _) => Dbr::Time {
                status: posted.status().unwrap_or_default(),
                timestamp: posted.timestamp().unwrap_or(state.timestamp),
                value: DbrValue::String(vec![label_of(&state.enum_labels, *index)]),
            }
            .convert_to(requested),
            _ => posted.convert_to(requested),
        }
    }

    pub(crate) fn read_callback(&self) -> Option<ReadCallback> {
        self.shared.state.lock().unwrap().on_read.clone()
    }

    pub(crate) fn write_callback(&self) -> Option<WriteCallback> {
        self.shared.state.lock().unwrap().on_write.clone()
    }

    /// Start tracking a deferred request, so destroying the variable cancels it
    pub(crate) fn begin_io(
        &self,
        kind: IoKind,
        completer: Box<dyn AsyncIoCompleter>,
    ) -> Result<Arc<Handshake>, ErrorCondition> {
        let server = self
            .shared
            .server
            .upgrade()
            .ok_or(ErrorCondition::DisconnChid)?;
        let mut state = self.shared.state.lock().unwrap();
        if state.destroyed {
            return Err(ErrorCondition::DisconnChid);
        }
        let handshake = Handshake::new(kind, completer, server.wakeup_sender());
        state.outstanding.retain(|w| w.strong_count() > 0);
        state.outstanding.push(Arc::downgrade(&handshake));
        Ok(handshake)
    }

    /// Defer client reads to `callback`, or serve them directly with `None`
    pub fn on_read_request(&self, callback: Option<ReadCallback>) {
        self.shared.state.lock().unwrap().on_read = callback;
    }

    /// Defer client writes to `callback`, or store them directly with `None`
    pub fn on_write_request(&self, callback: Option<WriteCallback>) {
        self.shared.state.lock().unwrap().on_write = callback;
    }

    pub fn display_properties(&self) -> DisplayProperties {
        self.shared.state.lock().unwrap().display.clone()
    }

    pub fn low_limit(&self) -> f64 {
        self.shared.state.lock().unwrap().display.low_limit
    }

    pub fn set_low_limit(&self, limit: f64) {
        self.shared.state.lock().unwrap().display.low_limit = limit;
    }

    pub fn high_limit(&self) -> f64 {
        self.shared.state.lock().unwrap().display.high_limit
    }

    pub fn set_high_limit(&self, limit: f64) {
        self.shared.state.lock().unwrap().display.high_limit = limit;
    }

    pub fn precision(&self) -> u16 {
        self.shared.state.lock().unwrap().display.precision
    }

    pub fn set_precision(&self, precision: u16) {
        self.shared.state.lock().unwrap().display.precision = precision;
    }

    pub fn units(&self) -> String {
        self.shared.state.lock().unwrap().display.units.clone()
    }

    pub fn set_units(&self, units: &str) -> Result<(), ServerError> {
        if units.len() + 1 > MAX_UNITS_SIZE {
            return Err(ConversionError::StringTooLong {
                max: MAX_UNITS_SIZE - 1,
            }
            .into());
        }
        self.shared.state.lock().unwrap().display.units = units.to_string();
        Ok(())
    }

    pub fn enum_labels(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().enum_labels.clone()
    }

    /// Replace the state labels of an enum variable
    ///
    /// At most 16 unique labels, each shorter than 26 bytes.
    pub fn set_enum_labels<S: AsRef<str>>(&self, labels: &[S]) -> Result<(), ServerError> {
        if self.shared.scalar_type != ScalarType::Enum {
            return Err(ServerError::NotEnum(self.shared.name.clone()));
        }
        if labels.len() > MAX_ENUM_STATES {
            return Err(ServerError::InvalidEnumTable(format!(
                "{} labels given, at most {MAX_ENUM_STATES} allowed",
                labels.len()
            )));
        }
        let mut seen = HashSet::new();
        for label in labels.iter().map(AsRef::as_ref) {
            if label.len() + 1 > MAX_ENUM_STRING_SIZE {
                return Err(ServerError::InvalidEnumTable(format!(
                    "label '{label}' is longer than {} bytes",
                    MAX_ENUM_STRING_SIZE - 1
                )));
            }
            if !seen.insert(label) {
                return Err(ServerError::InvalidEnumTable(format!(
                    "label '{label}' is repeated"
                )));
            }
        }
        self.shared.state.lock().unwrap().enum_labels =
            labels.iter().map(|l| l.as_ref().to_string()).collect();
        Ok(())
    }

    /// The label of the current state, or the index as text past the table end
    pub fn read_as_enum_label(&self) -> Result<String, ServerError> {
        let state = self.shared.state.lock().unwrap();
        match &state.data {
            PvData::Enum(indices) => Ok(label_of(
                &state.enum_labels,
                indices.first().copied().unwrap_or_default(),
            )),
            _ => Err(ServerError::NotEnum(self.shared.name.clone())),
        }
    }

    /// Remove the variable from its server
    ///
    /// Clients attached to the variable are disconnected, then deferred requests still
    /// waiting on the host are canceled. Destroying twice is harmless.
    pub fn destroy(&self) {
        let _span = debug_span!("destroy", variable = %self.shared.id, name = %self.shared.name)
            .entered();
        let outstanding = {
            let mut state = self.shared.state.lock().unwrap();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.on_read = None;
            state.on_write = None;
            std::mem::take(&mut state.outstanding)
        };
        // Detach before canceling, so clients of a library that drops its tokens on
        // detach only ever see the disconnect
        if let Some(server) = self.shared.server.upgrade() {
            server.forget(self);
            server.detach_clients(self);
            let purged = server.purge_requests(self.shared.id);
            if !purged.is_empty() {
                debug!("Purged {} queued requests", purged.len());
            }
        }
        let canceled = outstanding
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|handshake| handshake.cancel())
            .count();
        if canceled > 0 {
            debug!("Canceled {canceled} outstanding requests");
        }
        debug!("Destroyed");
    }
}
