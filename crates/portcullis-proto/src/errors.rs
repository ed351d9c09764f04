//! Error types for the portcullis wire codecs.
//!
//! All errors are structured, testable, and provide actionable information.

use thiserror::Error;

/// Errors raised while encoding or decoding wire structures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Record errors
    /// Record header names a content type we do not know
    #[error("invalid content type: {0}")]
    InvalidContentType(u8),

    /// Record fragment exceeds the maximum allowed size
    #[error("record too large: {size} bytes exceeds maximum {max}")]
    RecordTooLarge {
        /// Fragment size claimed or supplied
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // Alert errors
    /// Alert body has the wrong length
    #[error("malformed alert: expected 2 bytes, got {0}")]
    MalformedAlert(usize),

    /// Alert level byte is neither warning nor fatal
    #[error("invalid alert level: {0}")]
    InvalidAlertLevel(u8),

    // EGD errors
    /// A single EGD read may not ask for more than 255 bytes
    #[error("EGD request too large: {requested} bytes exceeds maximum {max}")]
    EgdRequestTooLarge {
        /// Bytes requested
        requested: usize,
        /// Protocol maximum
        max: usize,
    },

    /// Daemon returned more bytes than were requested
    #[error("EGD response overrun: requested {requested} bytes, daemon announced {announced}")]
    EgdResponseOverrun {
        /// Bytes requested
        requested: u8,
        /// Bytes announced in the response count byte
        announced: u8,
    },

    /// Unknown EGD command byte
    #[error("invalid EGD command: {0:#04x}")]
    InvalidEgdCommand(u8),
}

/// Convenient Result type alias for codec operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
