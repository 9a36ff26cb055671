//! Custom error types for the X-ray generator adapter.
//!
//! This module defines the primary error type, `XrayError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failures that can occur while talking to the generator, from socket
//! problems to malformed replies and commands issued in the wrong device state.
//!
//! ## Error Hierarchy
//!
//! `XrayError` groups its variants by the layer that raises them:
//!
//! - **Connection layer** (`Connection`, `NotConnected`, `Timeout`): the TCP session
//!   failed or the instrument did not answer in time. These abort the exchange in
//!   flight and are never retried automatically.
//! - **Protocol layer** (`Format`): a reply did not match the expected marker, width
//!   or terminator. A poll cycle skips the offending field and carries on.
//! - **Decoding** (`UnknownFaultCode`): a fault code missing from the message table.
//!   Callers normally recover with a fallback message.
//! - **Caller errors** (`StateViolation`, `OutOfRange`, `InvalidValue`, `UnknownField`,
//!   `UnknownAction`): rejected before anything is sent to the instrument.
//! - **Setup** (`Template`, `Config`): malformed command templates and configuration
//!   problems.

use crate::config::ConfigError;
use crate::instrument::state::InstrumentState;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type XrayResult<T> = std::result::Result<T, XrayError>;

/// Why a reply was rejected by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatErrorKind {
    /// The reply did not start with the expected marker character.
    MissingMarker(char),
    /// The reply did not end with the configured terminator.
    MissingTerminator,
    /// The numeric payload had the wrong number of digits.
    WrongWidth { expected: usize, actual: usize },
    /// The numeric payload contained something other than digits.
    NotNumeric,
    /// The value does not fit the declared type.
    Overflow,
    /// The payload is not valid ASCII/UTF-8 text.
    NotText,
    /// The reply grew past the session's size limit.
    TooLarge { max_bytes: usize },
}

impl std::fmt::Display for FormatErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatErrorKind::MissingMarker(marker) => write!(f, "missing '{}' marker", marker),
            FormatErrorKind::MissingTerminator => write!(f, "missing terminator"),
            FormatErrorKind::WrongWidth { expected, actual } => {
                write!(f, "expected {} digits, got {}", expected, actual)
            }
            FormatErrorKind::NotNumeric => write!(f, "payload is not numeric"),
            FormatErrorKind::Overflow => write!(f, "value out of range for its type"),
            FormatErrorKind::NotText => write!(f, "payload is not valid text"),
            FormatErrorKind::TooLarge { max_bytes } => {
                write!(f, "reply exceeds {} bytes", max_bytes)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum XrayError {
    /// Socket failure or peer close. The session has been dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to {0}")]
    NotConnected(String),

    /// No complete reply in time. The session stays open.
    #[error("Timed out after {timeout:?} waiting for reply to '{command}'")]
    Timeout { command: String, timeout: Duration },

    /// A reply that does not match its template.
    #[error("Malformed reply {raw:?}: {reason}")]
    Format { reason: FormatErrorKind, raw: String },

    #[error("Unknown fault code {0}")]
    UnknownFaultCode(i32),

    /// Rejected before any I/O because of the instrument state.
    #[error("'{operation}' is not allowed while the instrument is {state}")]
    StateViolation {
        operation: String,
        state: InstrumentState,
    },

    #[error("Value {value} for '{field}' out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown field '{0}'")]
    UnknownField(String),

    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Command template error: {0}")]
    Template(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl XrayError {
    /// Build a format error from a reason and the offending raw bytes.
    pub fn format(reason: FormatErrorKind, raw: &[u8]) -> Self {
        XrayError::Format {
            reason,
            raw: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    /// Errors that end the current exchange and leave the session in doubt.
    ///
    /// A poll cycle aborts on these instead of skipping the field.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            XrayError::Connection(_) | XrayError::NotConnected(_) | XrayError::Timeout { .. }
        )
    }
}
