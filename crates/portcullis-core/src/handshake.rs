//! Per-connection handshake state machine.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ advance() ┌─────────────┐ negotiation done ┌─────────────┐
//! │ Idle │──────────>│ Negotiating │─────────────────>│ Established │
//! └──────┘           └─────────────┘                  └─────────────┘
//!                          │
//!                          │ protocol error, peer alert, timeout,
//!                          │ transport failure, credential rejection
//!                          ↓
//!                    ┌────────┐
//!                    │ Failed │
//!                    └────────┘
//! ```
//!
//! `Established` and `Failed` are terminal. Calling `advance()` in either
//! returns [`HandshakeError::InvalidState`] and changes nothing.
//!
//! # I/O
//!
//! Each `advance()` flushes pending output, performs at most one read, feeds
//! the bytes to the provider's [`Negotiation`], and flushes again. On a
//! non-blocking stream, `WouldBlock` yields [`HandshakeOutcome::InProgress`];
//! the caller decides when to call again. The engine never spawns threads.
//!
//! # Timeouts
//!
//! The deadline runs from the first `advance()` and is checked on every
//! call. [`HandshakeEngine::complete`] also arms the stream's read timeout
//! with the time left, so a silent peer cannot hold a blocking read past the
//! deadline. Callers driving `advance()` themselves own that wait.

use std::{io, sync::Arc, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use portcullis_proto::{Alert, AlertDescription, ContentType, Record, record::MAX_CIPHERTEXT_LEN};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    config::{HandshakeConfig, RecordConfig},
    credentials::{CredentialStore, DhParameterSet},
    crypto::{CryptoProvider, HandshakeContext, Negotiation, NegotiationError},
    env::Environment,
    error::HandshakeError,
    record::RecordSession,
    transport::{ByteStream, Peer},
};

/// Upper bound on buffered, unconsumed handshake input.
const MAX_PENDING_INPUT: usize = 4 * MAX_CIPHERTEXT_LEN;

/// Client certificate policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerCertPolicy {
    /// Do not ask for a client certificate
    #[default]
    None,
    /// Ask; proceed without one if the client declines
    Request,
    /// Ask; fail the handshake if the client declines
    Require,
}

/// Handshake lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Created, no I/O yet
    Idle,
    /// Negotiation in progress
    Negotiating,
    /// Keys derived, ready for record I/O
    Established,
    /// Negotiation failed; the stream must be closed
    Failed(HandshakeError),
}

impl HandshakeState {
    /// Lowercase state name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Established => "established",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Established | Self::Failed(_))
    }
}

/// Result of a successful `advance()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// More round trips needed
    InProgress,
    /// Handshake finished; call `into_session`
    Complete,
}

#[derive(Debug, PartialEq, Eq)]
enum Flush {
    Done,
    Blocked,
}

impl From<NegotiationError> for HandshakeError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::Malformed(detail) | NegotiationError::UnexpectedMessage(detail) => {
                Self::ProtocolViolation(detail)
            },
            NegotiationError::Internal(detail) => {
                Self::ProtocolViolation(format!("provider failure: {detail}"))
            },
            NegotiationError::PeerAlert(alert) if alert.description.is_certificate_related() => {
                Self::CredentialRejected(format!("peer sent {alert}"))
            },
            NegotiationError::PeerAlert(alert) => Self::PeerRejected(alert),
            NegotiationError::CertificateRejected(detail) => Self::CredentialRejected(detail),
        }
    }
}

/// Drives one connection from accept to established keys.
///
/// Borrows the stream for its lifetime; the stream moves on to the
/// [`RecordSession`] returned by [`HandshakeEngine::into_session`].
pub struct HandshakeEngine<'a, S, C, E>
where
    S: ByteStream,
    C: CryptoProvider,
    E: Environment,
{
    stream: &'a mut S,
    credentials: &'a CredentialStore<E>,
    crypto: &'a C,
    config: HandshakeConfig,
    peer_cert_policy: PeerCertPolicy,
    peer: Peer,
    state: HandshakeState,
    dh_parameters: Option<Arc<DhParameterSet>>,
    negotiation: Option<C::Negotiation>,
    channel: Option<C::Channel>,
    peer_certificate: Option<Bytes>,
    negotiation_complete: bool,
    started_at: Option<E::Instant>,
    blocking: bool,
    inbound: BytesMut,
    outbound: BytesMut,
    scratch: Vec<u8>,
}

impl<'a, S, C, E> HandshakeEngine<'a, S, C, E>
where
    S: ByteStream,
    C: CryptoProvider,
    E: Environment,
{
    /// Creates an engine in `Idle` with [`PeerCertPolicy::None`].
    pub fn new(
        stream: &'a mut S,
        credentials: &'a CredentialStore<E>,
        crypto: &'a C,
        config: &HandshakeConfig,
    ) -> Self {
        let peer = Peer(stream.peer_addr());
        Self {
            stream,
            credentials,
            crypto,
            config: config.clone(),
            peer_cert_policy: PeerCertPolicy::None,
            peer,
            state: HandshakeState::Idle,
            dh_parameters: None,
            negotiation: None,
            channel: None,
            peer_certificate: None,
            negotiation_complete: false,
            started_at: None,
            blocking: false,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            scratch: Vec::new(),
        }
    }

    /// Sets the client certificate policy.
    ///
    /// Only available before the engine is driven, so the policy cannot
    /// change mid-handshake.
    #[must_use]
    pub fn with_peer_cert_policy(mut self, policy: PeerCertPolicy) -> Self {
        self.peer_cert_policy = policy;
        self
    }

    /// Current state.
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Client certificate policy in force.
    pub fn peer_cert_policy(&self) -> PeerCertPolicy {
        self.peer_cert_policy
    }

    /// DH parameters snapshotted at the first `advance()`.
    pub fn dh_parameters(&self) -> Option<&Arc<DhParameterSet>> {
        self.dh_parameters.as_ref()
    }

    /// Certificate the client presented, once established.
    pub fn peer_certificate(&self) -> Option<&Bytes> {
        self.peer_certificate.as_ref()
    }

    /// Remote address of the stream.
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Makes as much progress as the stream allows without blocking twice.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::InvalidState`] if already `Established` or
    ///   `Failed`; the state is left unchanged
    /// - any other variant moves the engine to `Failed`
    pub fn advance(&mut self) -> Result<HandshakeOutcome, HandshakeError> {
        if self.state.is_terminal() {
            return Err(HandshakeError::InvalidState {
                operation: "advance",
                state: self.state.name(),
            });
        }

        match self.drive() {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.fail(&err);
                Err(err)
            },
        }
    }

    /// Calls `advance()` until the handshake completes or fails.
    ///
    /// For blocking streams. Every read waits at most until the deadline; a
    /// read that runs out of time fails the handshake with
    /// [`HandshakeError::Timeout`]. The read timeout is cleared on return.
    ///
    /// # Errors
    ///
    /// The error that moved the engine to `Failed`.
    pub fn complete(&mut self) -> Result<(), HandshakeError> {
        self.blocking = true;
        let result = loop {
            match self.advance() {
                Ok(HandshakeOutcome::Complete) => break Ok(()),
                Ok(HandshakeOutcome::InProgress) => {},
                Err(err) => break Err(err),
            }
        };
        self.blocking = false;
        if let Err(error) = self.stream.set_read_timeout(None) {
            debug!(peer = %self.peer, %error, "could not clear read timeout");
        }
        result
    }

    /// Hands the stream and derived keys to a record session.
    ///
    /// # Errors
    ///
    /// The failure if the handshake failed, or
    /// [`HandshakeError::InvalidState`] if it has not finished.
    pub fn into_session(
        self,
        config: &RecordConfig,
    ) -> Result<RecordSession<'a, S, C::Channel>, HandshakeError> {
        let Self { stream, state, channel, inbound, peer, .. } = self;
        match (state, channel) {
            (HandshakeState::Established, Some(channel)) => {
                Ok(RecordSession::new(stream, channel, inbound, peer, config))
            },
            (HandshakeState::Failed(err), _) => Err(err),
            (state, _) => {
                Err(HandshakeError::InvalidState { operation: "into_session", state: state.name() })
            },
        }
    }

    fn drive(&mut self) -> Result<HandshakeOutcome, HandshakeError> {
        if self.state == HandshakeState::Idle {
            self.begin()?;
        }
        self.check_deadline()?;

        if self.flush_outbound()? == Flush::Blocked {
            return Ok(HandshakeOutcome::InProgress);
        }
        if self.negotiation_complete {
            return self.finish();
        }
        if !self.read_input()? {
            return Ok(HandshakeOutcome::InProgress);
        }

        self.negotiate()?;

        if self.flush_outbound()? == Flush::Blocked {
            return Ok(HandshakeOutcome::InProgress);
        }
        if self.negotiation_complete {
            return self.finish();
        }
        Ok(HandshakeOutcome::InProgress)
    }

    fn begin(&mut self) -> Result<(), HandshakeError> {
        let parameters = self.credentials.current_dh_parameters();
        debug!(
            peer = %self.peer,
            dh_generation = parameters.generation(),
            policy = ?self.peer_cert_policy,
            "handshake started"
        );
        self.dh_parameters = Some(parameters);
        self.started_at = Some(self.credentials.env().now());
        self.negotiation = Some(self.crypto.start_negotiation());
        self.state = HandshakeState::Negotiating;
        self.negotiate()
    }

    fn elapsed(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |started_at| self.credentials.env().now() - started_at)
    }

    fn check_deadline(&self) -> Result<(), HandshakeError> {
        let elapsed = self.elapsed();
        if elapsed > self.config.timeout {
            return Err(HandshakeError::Timeout { elapsed });
        }
        Ok(())
    }

    /// Reads once. Returns `false` if the stream had nothing ready.
    fn read_input(&mut self) -> Result<bool, HandshakeError> {
        if self.blocking {
            let remaining = self.config.timeout.saturating_sub(self.elapsed());
            self.stream
                .set_read_timeout(Some(remaining))
                .map_err(|e| HandshakeError::TransportClosed(e.to_string()))?;
        }
        self.scratch.resize(self.config.read_chunk.max(1), 0);
        match self.stream.read(&mut self.scratch) {
            Ok(0) => Err(HandshakeError::TransportClosed("peer closed the connection".to_string())),
            Ok(n) => {
                trace!(peer = %self.peer, bytes = n, "handshake input");
                self.inbound.extend_from_slice(&self.scratch[..n]);
                if self.inbound.len() > MAX_PENDING_INPUT {
                    return Err(HandshakeError::ProtocolViolation(format!(
                        "{} bytes of unconsumed handshake input",
                        self.inbound.len()
                    )));
                }
                Ok(true)
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e)
                if self.blocking
                    && matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Err(HandshakeError::Timeout { elapsed: self.elapsed().max(self.config.timeout) })
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(HandshakeError::TransportClosed(e.to_string())),
        }
    }

    fn negotiate(&mut self) -> Result<(), HandshakeError> {
        let credentials = self.credentials;
        let Some(parameters) = self.dh_parameters.clone() else {
            return Err(HandshakeError::InvalidState {
                operation: "negotiate",
                state: self.state.name(),
            });
        };
        let context = HandshakeContext {
            certificate_chain: credentials.certificate_chain(),
            private_key: credentials.private_key(),
            dh_parameters: &parameters,
            peer_cert_policy: self.peer_cert_policy,
        };
        let Some(negotiation) = self.negotiation.as_mut() else {
            return Err(HandshakeError::InvalidState {
                operation: "negotiate",
                state: self.state.name(),
            });
        };

        loop {
            let step = negotiation.negotiate(&context, &self.inbound)?;
            if step.consumed > self.inbound.len() {
                return Err(HandshakeError::ProtocolViolation(format!(
                    "provider consumed {} of {} buffered bytes",
                    step.consumed,
                    self.inbound.len()
                )));
            }
            self.inbound.advance(step.consumed);
            self.outbound.extend_from_slice(&step.output);

            if step.complete {
                self.negotiation_complete = true;
                return Ok(());
            }
            if step.consumed == 0 || self.inbound.is_empty() {
                return Ok(());
            }
        }
    }

    fn flush_outbound(&mut self) -> Result<Flush, HandshakeError> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(HandshakeError::TransportClosed(
                        "transport accepted no bytes".to_string(),
                    ));
                },
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(HandshakeError::TransportClosed(e.to_string())),
            }
        }
        Ok(Flush::Done)
    }

    fn finish(&mut self) -> Result<HandshakeOutcome, HandshakeError> {
        let Some(negotiation) = self.negotiation.take() else {
            return Err(HandshakeError::InvalidState {
                operation: "finish",
                state: self.state.name(),
            });
        };
        let peer_certificate = negotiation.peer_certificate().cloned();

        if self.peer_cert_policy == PeerCertPolicy::Require && peer_certificate.is_none() {
            return Err(HandshakeError::CredentialRejected(
                "client certificate required but not presented".to_string(),
            ));
        }

        self.channel = Some(negotiation.derive_keys()?);
        self.peer_certificate = peer_certificate;
        self.state = HandshakeState::Established;
        debug!(
            peer = %self.peer,
            client_certificate = self.peer_certificate.is_some(),
            "handshake established"
        );
        Ok(HandshakeOutcome::Complete)
    }

    fn fail(&mut self, err: &HandshakeError) {
        debug!(peer = %self.peer, kind = err.kind(), error = %err, "handshake failed");
        if let Some(alert) = alert_for(err) {
            self.send_alert(alert);
        }
        self.state = HandshakeState::Failed(err.clone());
        self.negotiation = None;
        self.inbound.clear();
        self.outbound.clear();
    }

    /// Best-effort plaintext alert; a single write, errors ignored.
    fn send_alert(&mut self, alert: Alert) {
        let mut wire = Vec::with_capacity(7);
        let record = Record::new(ContentType::Alert, alert.to_bytes().to_vec());
        if record.encode(&mut wire).is_ok() {
            let _ = self.stream.write(&wire);
        }
    }
}

/// Alert owed to the peer for a local rejection.
fn alert_for(err: &HandshakeError) -> Option<Alert> {
    match err {
        HandshakeError::ProtocolViolation(_) => Some(Alert::fatal(AlertDescription::DecodeError)),
        HandshakeError::CredentialRejected(_) => {
            Some(Alert::fatal(AlertDescription::CertificateRequired))
        },
        HandshakeError::Timeout { .. } => Some(Alert::fatal(AlertDescription::HandshakeFailure)),
        HandshakeError::PeerRejected(_)
        | HandshakeError::TransportClosed(_)
        | HandshakeError::InvalidState { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!HandshakeState::Idle.is_terminal());
        assert!(!HandshakeState::Negotiating.is_terminal());
        assert!(HandshakeState::Established.is_terminal());
        assert!(
            HandshakeState::Failed(HandshakeError::TransportClosed("eof".to_string())).is_terminal()
        );
    }

    #[test]
    fn certificate_alerts_are_credential_rejections() {
        let err = HandshakeError::from(NegotiationError::PeerAlert(Alert::fatal(
            AlertDescription::BadCertificate,
        )));
        assert_eq!(err.kind(), "credential_rejected");

        let err = HandshakeError::from(NegotiationError::PeerAlert(Alert::fatal(
            AlertDescription::HandshakeFailure,
        )));
        assert_eq!(err, HandshakeError::PeerRejected(Alert::fatal(AlertDescription::HandshakeFailure)));
    }

    #[test]
    fn malformed_input_is_protocol_violation() {
        let err = HandshakeError::from(NegotiationError::Malformed("short hello".to_string()));
        assert_eq!(err, HandshakeError::ProtocolViolation("short hello".to_string()));
        let err = HandshakeError::from(NegotiationError::UnexpectedMessage("finished".to_string()));
        assert_eq!(err.kind(), "protocol_violation");
    }

    #[test]
    fn peer_caused_failures_owe_no_alert() {
        assert!(alert_for(&HandshakeError::TransportClosed("eof".to_string())).is_none());
        assert!(
            alert_for(&HandshakeError::PeerRejected(Alert::fatal(AlertDescription::UserCanceled)))
                .is_none()
        );
        assert!(alert_for(&HandshakeError::ProtocolViolation("x".to_string())).is_some());
    }

    #[test]
    fn policy_names() {
        assert_eq!(PeerCertPolicy::default(), PeerCertPolicy::None);
    }
}
