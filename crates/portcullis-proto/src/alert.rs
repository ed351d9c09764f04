//! Alert messages and their classification.
//!
//! An alert is two bytes: a level and a description. The session shell only
//! needs to answer two questions about an alert:
//!
//! - Does it end the session? ([`Alert::is_fatal`])
//! - Is it the peer's orderly close? ([`Alert::is_close_notify`])
//!
//! Warning-level alerts other than `close_notify` are recoverable: the record
//! layer reports them and keeps the session open. Fatal-level alerts always
//! terminate the session.

use std::fmt;

use crate::errors::{ProtocolError, Result};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AlertLevel {
    /// Session may continue
    Warning = 1,
    /// Session must terminate
    Fatal = 2,
}

impl AlertLevel {
    /// Parse a level byte. Returns `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Warning),
            2 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Alert description codes.
///
/// Unknown codes are preserved in [`AlertDescription::Unknown`] rather than
/// rejected, so a newer peer's alert still gets classified by its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertDescription {
    /// Orderly close of the sending direction
    CloseNotify,
    /// Message arrived out of order
    UnexpectedMessage,
    /// Record failed integrity check
    BadRecordMac,
    /// Record exceeded the size limit
    RecordOverflow,
    /// Negotiation could not agree on parameters
    HandshakeFailure,
    /// Certificate was corrupt or failed verification
    BadCertificate,
    /// Certificate type not supported
    UnsupportedCertificate,
    /// Certificate revoked by its signer
    CertificateRevoked,
    /// Certificate expired or not yet valid
    CertificateExpired,
    /// Other certificate problem
    CertificateUnknown,
    /// Field out of range or inconsistent
    IllegalParameter,
    /// Message could not be parsed
    DecodeError,
    /// Cryptographic verification failed
    DecryptError,
    /// Protocol version not supported
    ProtocolVersion,
    /// Parameters below the required security level
    InsufficientSecurity,
    /// Local failure unrelated to the peer
    InternalError,
    /// Handshake cancelled by the user
    UserCanceled,
    /// Renegotiation refused
    NoRenegotiation,
    /// Peer certificate was required but not sent
    CertificateRequired,
    /// Code not known to this implementation
    Unknown(u8),
}

impl AlertDescription {
    /// Parse a description byte.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::CloseNotify,
            10 => Self::UnexpectedMessage,
            20 => Self::BadRecordMac,
            22 => Self::RecordOverflow,
            40 => Self::HandshakeFailure,
            42 => Self::BadCertificate,
            43 => Self::UnsupportedCertificate,
            44 => Self::CertificateRevoked,
            45 => Self::CertificateExpired,
            46 => Self::CertificateUnknown,
            47 => Self::IllegalParameter,
            50 => Self::DecodeError,
            51 => Self::DecryptError,
            70 => Self::ProtocolVersion,
            71 => Self::InsufficientSecurity,
            80 => Self::InternalError,
            90 => Self::UserCanceled,
            100 => Self::NoRenegotiation,
            116 => Self::CertificateRequired,
            other => Self::Unknown(other),
        }
    }

    /// Wire value of this description.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::CloseNotify => 0,
            Self::UnexpectedMessage => 10,
            Self::BadRecordMac => 20,
            Self::RecordOverflow => 22,
            Self::HandshakeFailure => 40,
            Self::BadCertificate => 42,
            Self::UnsupportedCertificate => 43,
            Self::CertificateRevoked => 44,
            Self::CertificateExpired => 45,
            Self::CertificateUnknown => 46,
            Self::IllegalParameter => 47,
            Self::DecodeError => 50,
            Self::DecryptError => 51,
            Self::ProtocolVersion => 70,
            Self::InsufficientSecurity => 71,
            Self::InternalError => 80,
            Self::UserCanceled => 90,
            Self::NoRenegotiation => 100,
            Self::CertificateRequired => 116,
            Self::Unknown(value) => value,
        }
    }

    /// Whether this alert is about the peer's certificate.
    pub fn is_certificate_related(self) -> bool {
        matches!(
            self,
            Self::BadCertificate
                | Self::UnsupportedCertificate
                | Self::CertificateRevoked
                | Self::CertificateExpired
                | Self::CertificateUnknown
                | Self::CertificateRequired
        )
    }
}

/// A two-byte alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alert {
    /// Severity
    pub level: AlertLevel,
    /// What happened
    pub description: AlertDescription,
}

impl Alert {
    /// Encoded size of an alert.
    pub const LEN: usize = 2;

    /// Create an alert.
    #[must_use]
    pub fn new(level: AlertLevel, description: AlertDescription) -> Self {
        Self { level, description }
    }

    /// The orderly-close alert.
    #[must_use]
    pub fn close_notify() -> Self {
        Self::new(AlertLevel::Warning, AlertDescription::CloseNotify)
    }

    /// A fatal alert with the given description.
    #[must_use]
    pub fn fatal(description: AlertDescription) -> Self {
        Self::new(AlertLevel::Fatal, description)
    }

    /// A warning alert with the given description.
    #[must_use]
    pub fn warning(description: AlertDescription) -> Self {
        Self::new(AlertLevel::Warning, description)
    }

    /// Whether this is the peer's orderly close.
    pub fn is_close_notify(&self) -> bool {
        self.description == AlertDescription::CloseNotify
    }

    /// Whether receiving this alert terminates the session.
    pub fn is_fatal(&self) -> bool {
        self.level == AlertLevel::Fatal
    }

    /// Wire encoding.
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        [self.level as u8, self.description.to_u8()]
    }

    /// Parse an alert body.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MalformedAlert`] if `src` is not exactly two bytes
    /// - [`ProtocolError::InvalidAlertLevel`] for an unknown level
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        let [level, description] = src else {
            return Err(ProtocolError::MalformedAlert(src.len()));
        };

        let level = AlertLevel::from_u8(*level).ok_or(ProtocolError::InvalidAlertLevel(*level))?;
        Ok(Self { level, description: AlertDescription::from_u8(*description) })
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            AlertLevel::Warning => "warning",
            AlertLevel::Fatal => "fatal",
        };
        write!(f, "{} alert {:?} ({})", level, self.description, self.description.to_u8())
    }
}
