//! Interaction model status codes.

/// Status carried in StatusIB / StatusResponse. Unknown codes are preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    Failure,
    InvalidSubscription,
    UnsupportedAccess,
    UnsupportedEndpoint,
    InvalidAction,
    UnsupportedCommand,
    InvalidCommand,
    UnsupportedAttribute,
    ConstraintError,
    UnsupportedWrite,
    ResourceExhausted,
    NotFound,
    InvalidDataType,
    UnsupportedRead,
    DataVersionMismatch,
    Timeout,
    Busy,
    UnsupportedCluster,
    NeedsTimedInteraction,
    UnsupportedEvent,
    TimedRequestMismatch,
    Unknown(u8),
}

impl StatusCode {
    pub fn code(&self) -> u8 {
        match self {
            StatusCode::Success => 0x00,
            StatusCode::Failure => 0x01,
            StatusCode::InvalidSubscription => 0x7d,
            StatusCode::UnsupportedAccess => 0x7e,
            StatusCode::UnsupportedEndpoint => 0x7f,
            StatusCode::InvalidAction => 0x80,
            StatusCode::UnsupportedCommand => 0x81,
            StatusCode::InvalidCommand => 0x85,
            StatusCode::UnsupportedAttribute => 0x86,
            StatusCode::ConstraintError => 0x87,
            StatusCode::UnsupportedWrite => 0x88,
            StatusCode::ResourceExhausted => 0x89,
            StatusCode::NotFound => 0x8b,
            StatusCode::InvalidDataType => 0x8d,
            StatusCode::UnsupportedRead => 0x8f,
            StatusCode::DataVersionMismatch => 0x92,
            StatusCode::Timeout => 0x94,
            StatusCode::Busy => 0x9c,
            StatusCode::UnsupportedCluster => 0xc3,
            StatusCode::NeedsTimedInteraction => 0xc6,
            StatusCode::UnsupportedEvent => 0xc7,
            StatusCode::TimedRequestMismatch => 0xc9,
            StatusCode::Unknown(c) => *c,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == StatusCode::Success
    }

    /// Path addressed something the node does not have.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StatusCode::NotFound
                | StatusCode::UnsupportedEndpoint
                | StatusCode::UnsupportedCluster
                | StatusCode::UnsupportedAttribute
                | StatusCode::UnsupportedEvent
                | StatusCode::UnsupportedCommand
        )
    }
}

impl From<u8> for StatusCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => StatusCode::Success,
            0x01 => StatusCode::Failure,
            0x7d => StatusCode::InvalidSubscription,
            0x7e => StatusCode::UnsupportedAccess,
            0x7f => StatusCode::UnsupportedEndpoint,
            0x80 => StatusCode::InvalidAction,
            0x81 => StatusCode::UnsupportedCommand,
            0x85 => StatusCode::InvalidCommand,
            0x86 => StatusCode::UnsupportedAttribute,
            0x87 => StatusCode::ConstraintError,
            0x88 => StatusCode::UnsupportedWrite,
            0x89 => StatusCode::ResourceExhausted,
            0x8b => StatusCode::NotFound,
            0x8d => StatusCode::InvalidDataType,
            0x8f => StatusCode::UnsupportedRead,
            0x92 => StatusCode::DataVersionMismatch,
            0x94 => StatusCode::Timeout,
            0x9c => StatusCode::Busy,
            0xc3 => StatusCode::UnsupportedCluster,
            0xc6 => StatusCode::NeedsTimedInteraction,
            0xc7 => StatusCode::UnsupportedEvent,
            0xc9 => StatusCode::TimedRequestMismatch,
            c => StatusCode::Unknown(c),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Success => write!(f, "SUCCESS"),
            StatusCode::Failure => write!(f, "FAILURE"),
            StatusCode::InvalidSubscription => write!(f, "INVALID_SUBSCRIPTION"),
            StatusCode::UnsupportedAccess => write!(f, "UNSUPPORTED_ACCESS"),
            StatusCode::UnsupportedEndpoint => write!(f, "UNSUPPORTED_ENDPOINT"),
            StatusCode::InvalidAction => write!(f, "INVALID_ACTION"),
            StatusCode::UnsupportedCommand => write!(f, "UNSUPPORTED_COMMAND"),
            StatusCode::InvalidCommand => write!(f, "INVALID_COMMAND"),
            StatusCode::UnsupportedAttribute => write!(f, "UNSUPPORTED_ATTRIBUTE"),
            StatusCode::ConstraintError => write!(f, "CONSTRAINT_ERROR"),
            StatusCode::UnsupportedWrite => write!(f, "UNSUPPORTED_WRITE"),
            StatusCode::ResourceExhausted => write!(f, "RESOURCE_EXHAUSTED"),
            StatusCode::NotFound => write!(f, "NOT_FOUND"),
            StatusCode::InvalidDataType => write!(f, "INVALID_DATA_TYPE"),
            StatusCode::UnsupportedRead => write!(f, "UNSUPPORTED_READ"),
            StatusCode::DataVersionMismatch => write!(f, "DATA_VERSION_MISMATCH"),
            StatusCode::Timeout => write!(f, "TIMEOUT"),
            StatusCode::Busy => write!(f, "BUSY"),
            StatusCode::UnsupportedCluster => write!(f, "UNSUPPORTED_CLUSTER"),
            StatusCode::NeedsTimedInteraction => write!(f, "NEEDS_TIMED_INTERACTION"),
            StatusCode::UnsupportedEvent => write!(f, "UNSUPPORTED_EVENT"),
            StatusCode::TimedRequestMismatch => write!(f, "TIMED_REQUEST_MISMATCH"),
            StatusCode::Unknown(c) => write!(f, "UNKNOWN 0x{:x}", c),
        }
    }
}
