//! Cryptographic provider seam.
//!
//! The shell never performs key exchange, certificate verification, or record
//! protection itself. A [`CryptoProvider`] supplies three things:
//!
//! - a key-pair consistency check used when credentials are loaded
//! - a [`Negotiation`] per connection, fed raw transport bytes by the
//!   handshake engine until it reports completion
//! - a [`SecureChannel`] derived from a finished negotiation, used by the
//!   record session to protect and unprotect records
//!
//! Providers report what went wrong; the shell decides what it means for the
//! connection (see [`NegotiationError`] and [`RecordFault`]).

use bytes::Bytes;
use portcullis_proto::{Alert, record::MAX_FRAGMENT_LEN};

use crate::{
    credentials::{CertificateChain, DhParameterSet, PrivateKey},
    handshake::PeerCertPolicy,
};

/// Factory for per-connection negotiation state.
pub trait CryptoProvider: Send + Sync + 'static {
    /// Per-connection handshake state.
    type Negotiation: Negotiation<Channel = Self::Channel>;

    /// Established record protection.
    type Channel: SecureChannel;

    /// Whether `key` is the private half of the leaf certificate's key.
    fn verify_key_pair(&self, chain: &CertificateChain, key: &PrivateKey) -> bool;

    /// Starts negotiation for a freshly accepted connection.
    fn start_negotiation(&self) -> Self::Negotiation;
}

/// Everything a negotiation step may consult.
///
/// The DH parameters are the snapshot taken when the handshake started; a
/// rotation mid-handshake does not change them.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeContext<'a> {
    /// Server certificate chain, leaf first
    pub certificate_chain: &'a CertificateChain,
    /// Server private key
    pub private_key: &'a PrivateKey,
    /// DH parameters for this handshake
    pub dh_parameters: &'a DhParameterSet,
    /// Client certificate policy
    pub peer_cert_policy: PeerCertPolicy,
}

/// Result of feeding input to a negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationStep {
    /// Input bytes consumed; unconsumed bytes are offered again with more data
    pub consumed: usize,
    /// Bytes to transmit to the peer
    pub output: Vec<u8>,
    /// Negotiation finished; keys may be derived once `output` is sent
    pub complete: bool,
}

/// Negotiation failure as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    /// Peer input could not be parsed
    #[error("malformed handshake message: {0}")]
    Malformed(String),

    /// Peer sent a valid message at the wrong time
    #[error("unexpected handshake message: {0}")]
    UnexpectedMessage(String),

    /// Peer sent an alert
    #[error("peer sent alert: {0}")]
    PeerAlert(Alert),

    /// Peer certificate failed verification
    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    /// Provider failed for reasons unrelated to the peer
    #[error("provider failure: {0}")]
    Internal(String),
}

/// Per-connection negotiation state machine.
pub trait Negotiation: Send {
    /// Channel produced on success.
    type Channel: SecureChannel;

    /// Feeds buffered peer bytes.
    ///
    /// Called once with empty input when the handshake starts, then each time
    /// new bytes arrive. `input` holds every byte not yet consumed.
    ///
    /// # Errors
    ///
    /// Any error ends the handshake.
    fn negotiate(
        &mut self,
        context: &HandshakeContext<'_>,
        input: &[u8],
    ) -> Result<NegotiationStep, NegotiationError>;

    /// Certificate the peer presented, if any.
    fn peer_certificate(&self) -> Option<&Bytes>;

    /// Consumes the finished negotiation and derives session keys.
    ///
    /// # Errors
    ///
    /// [`NegotiationError::Internal`] if called before completion.
    fn derive_keys(self) -> Result<Self::Channel, NegotiationError>;
}

/// A record that was successfully unprotected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// Application data (possibly empty)
    Data(Bytes),
    /// Alert from the peer
    Alert(Alert),
    /// Record consumed with a non-fatal anomaly worth reporting
    Warning(String),
    /// Record consumed with nothing to report
    Ignored,
}

/// Record protection failure. Always fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordFault {
    /// Integrity check failed
    #[error("record failed integrity check: {0}")]
    Corrupted(String),

    /// Record framing or inner content is invalid
    #[error("record protocol violation: {0}")]
    Protocol(String),

    /// Sequence space or key usage limit reached
    #[error("record limit reached: {0}")]
    Exhausted(String),
}

impl RecordFault {
    /// Alert to send the peer before closing, if any.
    pub fn alert(&self) -> Option<Alert> {
        use portcullis_proto::AlertDescription;
        match self {
            Self::Corrupted(_) => Some(Alert::fatal(AlertDescription::BadRecordMac)),
            Self::Protocol(_) => Some(Alert::fatal(AlertDescription::DecodeError)),
            Self::Exhausted(_) => None,
        }
    }
}

/// Established, keyed record protection for one direction pair.
pub trait SecureChannel: Send {
    /// Largest plaintext accepted by one `encrypt_record`.
    fn max_fragment_len(&self) -> usize {
        MAX_FRAGMENT_LEN
    }

    /// Protects `plaintext` as one application-data record appended to `out`.
    ///
    /// # Errors
    ///
    /// [`RecordFault::Exhausted`] if no more records may be sent.
    fn encrypt_record(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), RecordFault>;

    /// Protects `alert` as one alert record appended to `out`.
    ///
    /// # Errors
    ///
    /// [`RecordFault::Exhausted`] if no more records may be sent.
    fn encrypt_alert(&mut self, alert: Alert, out: &mut Vec<u8>) -> Result<(), RecordFault>;

    /// Unprotects the first record in `input`.
    ///
    /// Returns `Ok(None)` if `input` does not yet hold a full record,
    /// otherwise the opened record and the bytes it occupied.
    ///
    /// # Errors
    ///
    /// Any [`RecordFault`] ends the session.
    fn decrypt_record(&mut self, input: &[u8]) -> Result<Option<(Opened, usize)>, RecordFault>;
}
