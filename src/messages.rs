//! Status codes and event masks shared with the Channel Access protocol layer
//!
//! Every CA library call reports an `ECA_*` status. These are modelled by
//! [`ErrorCondition`], which carries both the numeric wire code (message number
//! shifted over the severity bits) and the human-readable text CA itself reports.

/// Severity bits of an `ECA_*` status code
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
    Fatal = 6,
}

/// Channel Access status conditions, with their `ca_message` text
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorCondition {
    #[error("Normal successful completion")]
    Normal = 0,
    #[error("Unable to allocate additional dynamic memory")]
    AllocMem = 6,
    #[error(
        "The requested transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES"
    )]
    TooLarge = 9,
    #[error("User specified timeout on IO operation expired")]
    Timeout = 10,
    #[error("Sorry, that feature is planned but not supported at this time")]
    NoSupport = 11,
    #[error("The supplied string is unusually large")]
    StrTooBig = 12,
    #[error("The request was ignored because the specified channel is disconnected")]
    DisconnChid = 13,
    #[error("The data type specifed is invalid")]
    BadType = 14,
    #[error("Channel Access Internal Failure")]
    Internal = 17,
    #[error("The requested local DB operation failed")]
    DblClFail = 18,
    #[error("Channel read request failed")]
    GetFail = 19,
    #[error("Channel write request failed")]
    PutFail = 20,
    #[error("Channel subscription request failed")]
    AddFail = 21,
    #[error("Invalid element count requested")]
    BadCount = 22,
    #[error("Invalid string")]
    BadStr = 23,
    #[error("Virtual circuit disconnect")]
    Disconn = 24,
    #[error("Request inappropriate within subscription (monitor) update callback")]
    EvDisallow = 26,
    #[error("Bad event subscription (monitor) identifier")]
    BadMonId = 30,
    #[error("Invalid event selection mask")]
    BadMask = 41,
    #[error("IO operations have completed")]
    IoDone = 42,
    #[error("IO operations are in progress")]
    IoInProgress = 43,
    #[error("Read access denied")]
    NoRdAccess = 46,
    #[error("Write access denied")]
    NoWtAccess = 47,
    #[error("No reasonable data conversion between client and server types")]
    NoConvert = 50,
    #[error("Invalid channel identifier")]
    BadChId = 51,
    #[error("Invalid function pointer")]
    BadFuncPtr = 52,
    #[error("Not supported by attached service")]
    UnavailInServ = 54,
    #[error("User destroyed channel")]
    ChanDestroy = 55,
    #[error("Virtual circuit connection sequence aborted")]
    ConnSeqTmo = 59,
    #[error("Virtual circuit unresponsive")]
    UnrespTmo = 60,
}

impl ErrorCondition {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Normal => ErrorSeverity::Success,
            Self::IoDone | Self::IoInProgress => ErrorSeverity::Info,
            Self::Internal => ErrorSeverity::Fatal,
            Self::DisconnChid
            | Self::BadType
            | Self::BadStr
            | Self::EvDisallow
            | Self::BadMonId
            | Self::BadMask
            | Self::BadChId
            | Self::BadFuncPtr => ErrorSeverity::Error,
            _ => ErrorSeverity::Warning,
        }
    }

    /// The message number, without severity bits
    pub fn message_number(&self) -> u32 {
        *self as u32
    }

    /// The full `ECA_*` status value, as the C library would report it
    pub fn code(&self) -> u32 {
        (self.message_number() << 3) | self.severity() as u32
    }

    pub fn is_success(&self) -> bool {
        matches!(self.severity(), ErrorSeverity::Success | ErrorSeverity::Info)
    }

    /// Human-readable text for this status, equivalent to `ca_message`
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Look up a condition from a full `ECA_*` status value
    pub fn from_code(code: u32) -> Option<ErrorCondition> {
        ALL_CONDITIONS.iter().copied().find(|c| c.code() == code)
    }
}

const ALL_CONDITIONS: [ErrorCondition; 30] = [
    ErrorCondition::Normal,
    ErrorCondition::AllocMem,
    ErrorCondition::TooLarge,
    ErrorCondition::Timeout,
    ErrorCondition::NoSupport,
    ErrorCondition::StrTooBig,
    ErrorCondition::DisconnChid,
    ErrorCondition::BadType,
    ErrorCondition::Internal,
    ErrorCondition::DblClFail,
    ErrorCondition::GetFail,
    ErrorCondition::PutFail,
    ErrorCondition::AddFail,
    ErrorCondition::BadCount,
    ErrorCondition::BadStr,
    ErrorCondition::Disconn,
    ErrorCondition::EvDisallow,
    ErrorCondition::BadMonId,
    ErrorCondition::BadMask,
    ErrorCondition::IoDone,
    ErrorCondition::IoInProgress,
    ErrorCondition::NoRdAccess,
    ErrorCondition::NoWtAccess,
    ErrorCondition::NoConvert,
    ErrorCondition::BadChId,
    ErrorCondition::BadFuncPtr,
    ErrorCondition::UnavailInServ,
    ErrorCondition::ChanDestroy,
    ErrorCondition::ConnSeqTmo,
    ErrorCondition::UnrespTmo,
];

/// Which kinds of change a subscription wants to hear about
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl MonitorMask {
    pub const VALUE: MonitorMask = MonitorMask {
        value: true,
        log: false,
        alarm: false,
        property: false,
    };
    /// The mask used when a published variable changes value
    pub const VALUE_LOG: MonitorMask = MonitorMask {
        value: true,
        log: true,
        alarm: false,
        property: false,
    };

    /// Does a posted event with this mask interest a subscriber with `other`
    pub fn intersects(&self, other: &MonitorMask) -> bool {
        (self.value && other.value)
            || (self.log && other.log)
            || (self.alarm && other.alarm)
            || (self.property && other.property)
    }
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask::VALUE
    }
}

impl From<MonitorMask> for u16 {
    fn from(value: MonitorMask) -> Self {
        (value.value as u16)
            | (value.log as u16) << 1
            | (value.alarm as u16) << 2
            | (value.property as u16) << 3
    }
}

impl From<u16> for MonitorMask {
    fn from(value: u16) -> Self {
        MonitorMask {
            value: value & 0x01 != 0,
            log: value & 0x02 != 0,
            alarm: value & 0x04 != 0,
            property: value & 0x08 != 0,
        }
    }
}
