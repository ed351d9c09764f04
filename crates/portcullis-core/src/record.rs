//! Established-session record I/O.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ shutdown_write() ┌──────────────┐ peer close_notify ┌────────┐
//! │ Open │─────────────────>│ ShutdownSent │──────────────────>│ Closed │
//! └──────┘                  └──────────────┘                   └────────┘
//!    │                                                              ↑
//!    │ shutdown(), fatal error                                      │
//!    └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A peer close_notify while `Open` is a half-close: `receive()` reports
//! [`ReceiveOutcome::PeerClosed`] once and the session may keep sending.
//!
//! # Error Classes
//!
//! - Recoverable (warning alerts, provider warnings): reported, session
//!   stays usable
//! - Fatal (integrity failure, protocol violation, transport failure, EOF
//!   without close_notify): reported once as [`RecordError::Fatal`], the
//!   transport is closed, and every later call returns
//!   [`RecordError::SessionClosed`]
//!
//! # Invariants
//!
//! - No application data is accepted after shutdown or a fatal error
//! - At most one close_notify is sent
//! - The transport is closed at most once, from whichever path gets there
//!   first

use std::{io, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use portcullis_proto::Alert;
use tracing::{debug, trace, warn};

use crate::{
    config::RecordConfig,
    crypto::{Opened, SecureChannel},
    error::RecordError,
    transport::{ByteStream, Peer},
};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both directions usable (receive may have seen the peer's close)
    Open,
    /// Our close_notify sent; receive still usable
    ShutdownSent,
    /// No further I/O
    Closed,
}

/// How `shutdown` ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Send close_notify (once), then close the transport
    Graceful,
    /// Close the transport without notifying the peer
    Abrupt,
}

/// Successful `receive` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Application data, at most the requested capacity
    Data(Bytes),
    /// Peer sent close_notify; reported exactly once
    PeerClosed,
}

/// Record I/O over an established channel.
pub struct RecordSession<'a, S: ByteStream, Ch: SecureChannel> {
    stream: &'a mut S,
    channel: Ch,
    peer: Peer,
    state: SessionState,
    receive_chunk: usize,
    shutdown_timeout: Duration,
    peer_closed: bool,
    close_notify_sent: bool,
    transport_closed: bool,
    inbound: BytesMut,
    plaintext: BytesMut,
    outbound: BytesMut,
    scratch: Vec<u8>,
}

impl<'a, S: ByteStream, Ch: SecureChannel> RecordSession<'a, S, Ch> {
    /// Session over `stream`, starting with bytes already read past the end
    /// of the handshake.
    pub(crate) fn new(
        stream: &'a mut S,
        channel: Ch,
        leftover: BytesMut,
        peer: Peer,
        config: &RecordConfig,
    ) -> Self {
        Self {
            stream,
            channel,
            peer,
            state: SessionState::Open,
            receive_chunk: config.receive_chunk.max(1),
            shutdown_timeout: config.shutdown_timeout,
            peer_closed: false,
            close_notify_sent: false,
            transport_closed: false,
            inbound: leftover,
            plaintext: BytesMut::new(),
            outbound: BytesMut::new(),
            scratch: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the peer has sent close_notify.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Remote address of the stream.
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Protects and transmits up to one record's worth of `data`.
    ///
    /// Returns how many bytes of `data` were accepted. Accepted bytes are
    /// either written or buffered for the next `send`/`flush`. Sending an
    /// empty slice is a no-op returning 0.
    ///
    /// # Errors
    ///
    /// - [`RecordError::SessionClosed`] after shutdown or a fatal error
    /// - [`RecordError::WouldBlock`] if earlier output is still pending
    /// - [`RecordError::Fatal`] on transport or protection failure
    pub fn send(&mut self, data: &[u8]) -> Result<usize, RecordError> {
        if self.state != SessionState::Open {
            return Err(RecordError::SessionClosed);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if !self.flush_pending()? {
            return Err(RecordError::WouldBlock);
        }

        let accepted = data.len().min(self.channel.max_fragment_len());
        let mut record = Vec::with_capacity(accepted + 64);
        if let Err(fault) = self.channel.encrypt_record(&data[..accepted], &mut record) {
            return Err(self.fatal(fault.to_string(), None));
        }
        self.outbound.extend_from_slice(&record);
        trace!(peer = %self.peer, bytes = accepted, "record queued");

        self.flush_pending()?;
        Ok(accepted)
    }

    /// Sends all of `data`, then flushes.
    ///
    /// Intended for blocking streams; on a non-blocking stream this yields
    /// the thread between attempts until the stream drains.
    ///
    /// # Errors
    ///
    /// The first error other than [`RecordError::WouldBlock`].
    pub fn send_all(&mut self, mut data: &[u8]) -> Result<(), RecordError> {
        while !data.is_empty() {
            match self.send(data) {
                Ok(n) => data = &data[n..],
                Err(RecordError::WouldBlock) => std::thread::yield_now(),
                Err(err) => return Err(err),
            }
        }
        loop {
            match self.flush() {
                Err(RecordError::WouldBlock) => std::thread::yield_now(),
                other => return other,
            }
        }
    }

    /// Writes any buffered output.
    ///
    /// # Errors
    ///
    /// [`RecordError::WouldBlock`] if the stream cannot take it all yet;
    /// otherwise as for `send`.
    pub fn flush(&mut self) -> Result<(), RecordError> {
        if self.state == SessionState::Closed {
            return Err(RecordError::SessionClosed);
        }
        if self.flush_pending()? { Ok(()) } else { Err(RecordError::WouldBlock) }
    }

    /// Returns up to `capacity` bytes of application data.
    ///
    /// Data left over from a larger record is returned by later calls before
    /// more input is read. A `capacity` of zero is treated as one, so
    /// buffered data always makes progress.
    ///
    /// # Errors
    ///
    /// - [`RecordError::Recoverable`] for warning alerts and provider
    ///   warnings; call again
    /// - [`RecordError::WouldBlock`] on a non-blocking stream with no record
    ///   ready
    /// - [`RecordError::Fatal`] on corruption, protocol violation, transport
    ///   failure, or EOF without close_notify
    /// - [`RecordError::SessionClosed`] once closed, or after the peer's
    ///   close_notify has been reported
    pub fn receive(&mut self, capacity: usize) -> Result<ReceiveOutcome, RecordError> {
        if self.state == SessionState::Closed || self.peer_closed {
            return Err(RecordError::SessionClosed);
        }

        let capacity = capacity.max(1);
        loop {
            if !self.plaintext.is_empty() {
                let n = capacity.min(self.plaintext.len());
                return Ok(ReceiveOutcome::Data(self.plaintext.split_to(n).freeze()));
            }

            match self.channel.decrypt_record(&self.inbound) {
                Ok(Some((opened, consumed))) => {
                    if consumed == 0 || consumed > self.inbound.len() {
                        let reason = format!(
                            "channel consumed {consumed} of {} buffered bytes",
                            self.inbound.len()
                        );
                        return Err(self.fatal(reason, None));
                    }
                    self.inbound.advance(consumed);
                    if let Some(outcome) = self.on_record(opened)? {
                        return Ok(outcome);
                    }
                },
                Ok(None) => {
                    if !self.fill_inbound()? {
                        return Err(RecordError::WouldBlock);
                    }
                },
                Err(fault) => {
                    let alert = fault.alert();
                    return Err(self.fatal(fault.to_string(), alert));
                },
            }
        }
    }

    /// Sends close_notify and stops accepting application data, leaving the
    /// receive direction open.
    ///
    /// # Errors
    ///
    /// - [`RecordError::SessionClosed`] if already closed
    /// - [`RecordError::Fatal`] if the notification cannot be written
    pub fn shutdown_write(&mut self) -> Result<(), RecordError> {
        match self.state {
            SessionState::Closed => return Err(RecordError::SessionClosed),
            SessionState::ShutdownSent => return Ok(()),
            SessionState::Open => {},
        }

        self.queue_close_notify()?;
        self.state = SessionState::ShutdownSent;
        self.flush_pending()?;
        if self.peer_closed {
            self.close_transport();
        }
        Ok(())
    }

    /// Ends the session.
    ///
    /// Idempotent: the first call closes the transport, later calls do
    /// nothing. `Graceful` sends close_notify first unless one was already
    /// sent. Delivery is best effort: pending output gets at most
    /// `RecordConfig::shutdown_timeout` to drain before the transport is
    /// closed regardless.
    pub fn shutdown(&mut self, mode: ShutdownMode) {
        if self.state == SessionState::Closed {
            self.close_transport();
            return;
        }

        if mode == ShutdownMode::Graceful && self.queue_close_notify().is_ok() {
            self.bound_writes();
            if let Ok(false) = self.flush_pending() {
                debug!(peer = %self.peer, "peer not reading; close_notify dropped");
            }
        }
        debug!(peer = %self.peer, ?mode, "session shutdown");
        self.close_transport();
    }

    /// Handles one opened record. `None` means keep reading.
    fn on_record(&mut self, opened: Opened) -> Result<Option<ReceiveOutcome>, RecordError> {
        match opened {
            Opened::Data(bytes) => {
                self.plaintext.extend_from_slice(&bytes);
                Ok(None)
            },
            Opened::Ignored => Ok(None),
            Opened::Alert(alert) if alert.is_close_notify() => {
                debug!(peer = %self.peer, "peer sent close_notify");
                self.peer_closed = true;
                if self.state == SessionState::ShutdownSent {
                    self.close_transport();
                }
                Ok(Some(ReceiveOutcome::PeerClosed))
            },
            Opened::Alert(alert) if alert.is_fatal() => {
                Err(self.fatal(format!("peer sent {alert}"), None))
            },
            Opened::Alert(alert) => {
                warn!(peer = %self.peer, %alert, "peer sent warning alert");
                Err(RecordError::Recoverable(format!("peer sent {alert}")))
            },
            Opened::Warning(detail) => {
                warn!(peer = %self.peer, %detail, "non-fatal record anomaly");
                Err(RecordError::Recoverable(detail))
            },
        }
    }

    /// Reads once into the inbound buffer. Returns `false` on `WouldBlock`.
    fn fill_inbound(&mut self) -> Result<bool, RecordError> {
        self.scratch.resize(self.receive_chunk, 0);
        loop {
            match self.stream.read(&mut self.scratch) {
                Ok(0) => {
                    let reason = "transport closed without close_notify".to_string();
                    return Err(self.fatal(reason, None));
                },
                Ok(n) => {
                    self.inbound.extend_from_slice(&self.scratch[..n]);
                    return Ok(true);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(self.transport_failure(e)),
            }
        }
    }

    /// Writes buffered output. Returns `false` if the stream would block.
    fn flush_pending(&mut self) -> Result<bool, RecordError> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(self.transport_failure(io::ErrorKind::WriteZero.into()));
                },
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(false);
                },
                Err(e) => return Err(self.transport_failure(e)),
            }
        }
        Ok(true)
    }

    /// Limits how long teardown writes may block on a stalled peer.
    fn bound_writes(&mut self) {
        if let Err(error) = self.stream.set_write_timeout(Some(self.shutdown_timeout)) {
            debug!(peer = %self.peer, %error, "could not set write timeout");
        }
    }

    fn queue_close_notify(&mut self) -> Result<(), RecordError> {
        if self.close_notify_sent {
            return Ok(());
        }
        self.close_notify_sent = true;
        let mut record = Vec::new();
        if let Err(fault) = self.channel.encrypt_alert(Alert::close_notify(), &mut record) {
            return Err(self.fatal(fault.to_string(), None));
        }
        self.outbound.extend_from_slice(&record);
        Ok(())
    }

    /// Classifies a transport failure.
    ///
    /// A stream closed locally (through a close handle) reads as a closed
    /// session rather than a fault.
    fn transport_failure(&mut self, err: io::Error) -> RecordError {
        if matches!(err.kind(), io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected) {
            debug!(peer = %self.peer, error = %err, "transport closed locally");
            self.discard();
            self.close_transport();
            return RecordError::SessionClosed;
        }
        self.fatal(format!("transport failure: {err}"), None)
    }

    /// Moves to `Closed`, optionally telling the peer why, and closes the
    /// transport.
    fn fatal(&mut self, reason: String, alert: Option<Alert>) -> RecordError {
        warn!(peer = %self.peer, %reason, "fatal record error");
        self.discard();
        if let Some(alert) = alert {
            let mut record = Vec::new();
            if self.channel.encrypt_alert(alert, &mut record).is_ok() {
                self.bound_writes();
                let _ = self.stream.write(&record);
            }
        }
        self.close_transport();
        RecordError::Fatal(reason)
    }

    fn discard(&mut self) {
        self.plaintext.clear();
        self.inbound.clear();
        self.outbound.clear();
    }

    fn close_transport(&mut self) {
        self.state = SessionState::Closed;
        if self.transport_closed {
            return;
        }
        self.transport_closed = true;
        if let Err(error) = self.stream.close() {
            debug!(peer = %self.peer, %error, "transport close failed");
        }
    }
}

impl<S: ByteStream, Ch: SecureChannel> Drop for RecordSession<'_, S, Ch> {
    fn drop(&mut self) {
        self.close_transport();
    }
}
