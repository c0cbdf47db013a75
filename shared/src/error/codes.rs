//! Unified error codes for the edge agent
//!
//! Error codes are organized by category:
//! - 0xxx: General errors
//! - 1xxx: Registration errors
//! - 2xxx: Command errors
//! - 3xxx: Message errors
//! - 9xxx: System errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// All error codes are represented as u16 values so they serialize the same
/// way in the ledger, in logs and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Operation completed successfully
    Success = 0,
    /// Unknown error
    Unknown = 1,
    /// Validation failed
    ValidationFailed = 2,
    /// Resource not found
    NotFound = 3,
    /// Resource already exists
    AlreadyExists = 4,
    /// Invalid request
    InvalidRequest = 5,
    /// Invalid format
    InvalidFormat = 6,

    // ==================== 1xxx: Registration ====================
    /// Agent is not registered to the cloud
    NotRegistered = 1001,
    /// Registration handshake failed
    RegistrationFailed = 1002,
    /// Registration settings are missing a value required for the call
    RegistrationIncomplete = 1003,

    // ==================== 2xxx: Command ====================
    /// Command type is not allowed by the permission matrix
    CommandNotAuthorized = 2001,
    /// Command targets another agent version
    WrongTargetVersion = 2002,
    /// Command type is not supported
    UnsupportedCommand = 2003,
    /// Command handler failed
    CommandFailed = 2004,

    // ==================== 3xxx: Message ====================
    /// Message payload could not be built
    MessagePayloadFailed = 3001,

    // ==================== 9xxx: System ====================
    /// Internal error
    InternalError = 9001,
    /// Database error
    DatabaseError = 9002,
    /// Network error
    NetworkError = 9003,
    /// Timeout error
    TimeoutError = 9004,
    /// Configuration error
    ConfigError = 9005,
    /// Encryption or decryption failed
    CryptoError = 9006,
    /// Filesystem error
    IoError = 9007,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this is a success code
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Get the developer-facing English message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            // General
            ErrorCode::Success => "Operation completed successfully",
            ErrorCode::Unknown => "An unknown error occurred",
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::AlreadyExists => "Resource already exists",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::InvalidFormat => "Invalid format",

            // Registration
            ErrorCode::NotRegistered => "OIAnalytics not registered",
            ErrorCode::RegistrationFailed => "Registration failed",
            ErrorCode::RegistrationIncomplete => "Registration settings incomplete",

            // Command
            ErrorCode::CommandNotAuthorized => "Command is not authorized",
            ErrorCode::WrongTargetVersion => "Wrong target version",
            ErrorCode::UnsupportedCommand => "Command type is not supported",
            ErrorCode::CommandFailed => "Command execution failed",

            // Message
            ErrorCode::MessagePayloadFailed => "Message payload could not be built",

            // System
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database error",
            ErrorCode::NetworkError => "Network error",
            ErrorCode::TimeoutError => "Operation timed out",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::CryptoError => "Encryption error",
            ErrorCode::IoError => "Filesystem error",
        }
    }
}

impl From<ErrorCode> for u16 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error when converting from an invalid u16 to ErrorCode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            // General
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::Unknown),
            2 => Ok(ErrorCode::ValidationFailed),
            3 => Ok(ErrorCode::NotFound),
            4 => Ok(ErrorCode::AlreadyExists),
            5 => Ok(ErrorCode::InvalidRequest),
            6 => Ok(ErrorCode::InvalidFormat),

            // Registration
            1001 => Ok(ErrorCode::NotRegistered),
            1002 => Ok(ErrorCode::RegistrationFailed),
            1003 => Ok(ErrorCode::RegistrationIncomplete),

            // Command
            2001 => Ok(ErrorCode::CommandNotAuthorized),
            2002 => Ok(ErrorCode::WrongTargetVersion),
            2003 => Ok(ErrorCode::UnsupportedCommand),
            2004 => Ok(ErrorCode::CommandFailed),

            // Message
            3001 => Ok(ErrorCode::MessagePayloadFailed),

            // System
            9001 => Ok(ErrorCode::InternalError),
            9002 => Ok(ErrorCode::DatabaseError),
            9003 => Ok(ErrorCode::NetworkError),
            9004 => Ok(ErrorCode::TimeoutError),
            9005 => Ok(ErrorCode::ConfigError),
            9006 => Ok(ErrorCode::CryptoError),
            9007 => Ok(ErrorCode::IoError),

            _ => Err(InvalidErrorCode(value)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
