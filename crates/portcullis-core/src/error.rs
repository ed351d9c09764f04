//! Error types for the session core.
//!
//! Each component has its own error enum so callers can match on what they
//! can actually act on:
//!
//! - [`CredentialError`]: credential loading and DH regeneration
//! - [`EntropyError`]: random sources (OS, EGD daemon)
//! - [`HandshakeError`]: per-connection negotiation failures
//! - [`RecordError`]: established-session I/O, split into recoverable and
//!   fatal
//! - [`ManagerError`]: conditions that end the accept loop
//!
//! None of these carry key material in their messages.

use std::{io, time::Duration};

use portcullis_proto::{Alert, ProtocolError};

use crate::credentials::SecurityLevel;

/// Errors from loading credentials or regenerating DH parameters.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Certificate chain or private key is unusable
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Security level maps to no supported DH group size
    #[error("unsupported security level: {0:?}")]
    UnsupportedSecurityLevel(SecurityLevel),

    /// Entropy source could not supply enough bytes within the retry bound
    #[error("entropy unavailable after {attempts} attempt(s): {source}")]
    EntropyUnavailable {
        /// Attempts made before giving up
        attempts: u32,
        /// Last failure reported by the source
        #[source]
        source: EntropyError,
    },
}

/// Errors from a random source.
#[derive(Debug, thiserror::Error)]
pub enum EntropyError {
    /// Source answered, but with fewer bytes than requested
    #[error("insufficient entropy: requested {requested} bytes, received {received}")]
    Insufficient {
        /// Bytes requested
        requested: usize,
        /// Bytes actually delivered
        received: usize,
    },

    /// Source could not be reached within the reconnect bound
    #[error("entropy source unreachable after {attempts} connection attempt(s): {reason}")]
    Unreachable {
        /// Connection attempts made
        attempts: u32,
        /// Last I/O failure
        reason: String,
    },

    /// Daemon sent a response that violates the wire protocol
    #[error("entropy daemon protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Operating system generator failed
    #[error("system random generator failed: {0}")]
    Source(String),
}

impl EntropyError {
    /// Whether a later attempt may succeed.
    ///
    /// A daemon that speaks the protocol wrong will keep doing so; a pool
    /// that is merely drained or a socket that is briefly down may recover.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// Handshake failures.
///
/// Every variant except [`HandshakeError::InvalidState`] is terminal for the
/// connection: the engine moves to `Failed` and the stream must be closed.
/// Retrying a handshake on the same stream is never valid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// Malformed or out-of-order negotiation message
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Peer aborted negotiation with an alert
    #[error("peer rejected handshake: {0}")]
    PeerRejected(Alert),

    /// Negotiation did not finish within the configured deadline
    #[error("handshake timed out after {elapsed:?}")]
    Timeout {
        /// Time since the first `advance()`
        elapsed: Duration,
    },

    /// Transport failed or the peer disconnected mid-handshake
    #[error("transport closed during handshake: {0}")]
    TransportClosed(String),

    /// Peer certificate missing or unacceptable under the policy
    #[error("peer credentials rejected: {0}")]
    CredentialRejected(String),

    /// Operation called in a state that does not permit it
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the engine was in
        state: &'static str,
    },
}

impl HandshakeError {
    /// Short stable name for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::PeerRejected(_) => "peer_rejected",
            Self::Timeout { .. } => "timeout",
            Self::TransportClosed(_) => "transport_closed",
            Self::CredentialRejected(_) => "credential_rejected",
            Self::InvalidState { .. } => "invalid_state",
        }
    }

    /// Whether this error signals caller misuse rather than a peer or
    /// transport problem.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

/// Established-session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Non-fatal condition; the session stays usable
    #[error("recoverable record error: {0}")]
    Recoverable(String),

    /// Non-blocking stream has no data or buffer space right now
    #[error("operation would block")]
    WouldBlock,

    /// Fatal condition detected by this call; the session is now closed
    #[error("fatal record error: {0}")]
    Fatal(String),

    /// Session was already closed, by shutdown or an earlier fatal error
    #[error("session closed")]
    SessionClosed,
}

impl RecordError {
    /// Whether the session is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::SessionClosed)
    }
}

/// Conditions that end [`crate::manager::SessionManager::accept_loop`].
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Listener failed in a way that affects all future connections
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),

    /// `BlockingTasks` model selected outside a tokio runtime
    #[error("blocking-task connection model requires a tokio runtime")]
    NoRuntime,
}
