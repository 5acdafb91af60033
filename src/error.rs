//! Error types of the interaction layer.
//!
//! Structured errors are matched on by the engine (path-local vs. exchange-fatal),
//! `anyhow` is used at the I/O facing layer (transport, driver, config).

use thiserror::Error;

use crate::status::StatusCode;

/// Failure turning TLV bytes into a schema-validated value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("truncated tlv")]
    Truncated,

    #[error("datatype mismatch: expected {expected}, found {found}")]
    DatatypeMismatch { expected: String, found: String },

    #[error("mandatory field '{0}' missing")]
    MissingField(String),

    #[error("value of '{name}' does not fit in {width} bytes")]
    OutOfRange { name: String, width: u8 },

    #[error("invalid utf8 in string element")]
    InvalidUtf8,

    #[error("unsupported tlv tag control 0x{0:x}")]
    UnsupportedTag(u8),

    #[error("malformed tlv: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::DatatypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => DecodeError::Truncated,
            _ => DecodeError::Malformed(e.to_string()),
        }
    }
}

/// Failure turning a value into TLV bytes against a schema node.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("datatype mismatch: schema expects {expected}, value is {found}")]
    DatatypeMismatch { expected: String, found: String },

    #[error("mandatory field '{0}' missing")]
    MissingField(String),

    #[error("value of '{name}' does not fit in {width} bytes")]
    OutOfRange { name: String, width: u8 },

    #[error("schema node '{0}' is not resolved")]
    UnresolvedSchema(String),

    #[error("write error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EncodeError {
    fn from(e: std::io::Error) -> Self {
        EncodeError::Io(e.to_string())
    }
}

/// Interaction level failures as seen by the application.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("status {0}")]
    Status(StatusCode),

    #[error("data version mismatch")]
    DataVersionMismatch,

    #[error("exchange timed out - no acknowledgement from peer")]
    Timeout,

    #[error("cancelled by peer with status {0}")]
    Cancelled(StatusCode),

    #[error("malformed request")]
    MalformedRequest,

    #[error("subscription interval negotiation failed (min {min}s, max {max}s)")]
    IntervalNegotiationFailed { min: u16, max: u16 },

    #[error("session closed")]
    SessionClosed,

    #[error("unknown session {0}")]
    UnknownSession(u16),

    #[error("unknown interaction")]
    UnknownInteraction,

    #[error("wire error: {0}")]
    Wire(String),
}

impl From<std::io::Error> for ImError {
    fn from(e: std::io::Error) -> Self {
        ImError::Wire(e.to_string())
    }
}

impl From<anyhow::Error> for ImError {
    fn from(e: anyhow::Error) -> Self {
        ImError::Wire(format!("{:#}", e))
    }
}

pub type ImResult<T> = std::result::Result<T, ImError>;
