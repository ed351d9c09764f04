//! Client side of the toy handshake, for driving servers in tests.

use std::io;

use portcullis_core::{
    crypto::{Opened, RecordFault, SecureChannel},
    transport::ByteStream,
};
use portcullis_proto::{Alert, ContentType, Record, record::MAX_FRAGMENT_LEN};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::{
    loopback::LoopbackStream,
    sim_crypto::{
        CLIENT_FINISHED, CLIENT_HELLO, RANDOM_LEN, SERVER_FINISHED, SERVER_HELLO, SimChannel,
        VERIFY_LEN, client_write_key, finished, handshake_record, master_secret, server_write_key,
    },
};

/// Client-side failure.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Stream failure
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Server sent something the client cannot parse or verify
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server sent a plaintext alert during the handshake
    #[error("server rejected handshake: {0}")]
    Rejected(Alert),

    /// Stream ended
    #[error("connection closed")]
    Closed,
}

impl From<RecordFault> for PeerError {
    fn from(fault: RecordFault) -> Self {
        Self::Protocol(fault.to_string())
    }
}

/// Something the server sent after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Application data
    Data(Vec<u8>),
    /// Protected alert
    Alert(Alert),
    /// Stream ended
    Eof,
}

/// What the server's first flight revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerFlight {
    /// DH parameter generation the server used
    pub dh_generation: u64,
    /// DH modulus size
    pub dh_bits: u16,
    /// Whether the server asked for a client certificate
    pub certificate_requested: bool,
}

/// Toy-protocol client over any byte stream.
pub struct SimPeer<S: ByteStream = LoopbackStream> {
    stream: S,
    rng: ChaCha20Rng,
    certificate: Option<Vec<u8>>,
    client_random: [u8; RANDOM_LEN],
    master: Option<[u8; 32]>,
    channel: Option<SimChannel>,
    inbound: Vec<u8>,
}

impl<S: ByteStream> SimPeer<S> {
    /// Client over `stream` with randoms drawn from `seed`.
    pub fn new(stream: S, seed: u64) -> Self {
        Self {
            stream,
            rng: ChaCha20Rng::seed_from_u64(seed),
            certificate: None,
            client_random: [0; RANDOM_LEN],
            master: None,
            channel: None,
            inbound: Vec::new(),
        }
    }

    /// Presents `certificate` in the ClientHello.
    #[must_use]
    pub fn with_certificate(mut self, certificate: impl Into<Vec<u8>>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }

    /// Underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Underlying stream, mutably.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Whether keys have been derived.
    pub fn is_established(&self) -> bool {
        self.channel.is_some()
    }

    /// Runs the full client handshake.
    ///
    /// # Errors
    ///
    /// [`PeerError::Rejected`] if the server answered with an alert.
    pub fn handshake(&mut self) -> Result<ServerFlight, PeerError> {
        self.send_client_hello()?;
        let flight = self.read_server_flight()?;
        self.send_client_finished()?;
        Ok(flight)
    }

    /// Sends the ClientHello.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn send_client_hello(&mut self) -> Result<(), PeerError> {
        self.rng.fill_bytes(&mut self.client_random);
        let certificate = self.certificate.clone().unwrap_or_default();
        let cert_len = u16::try_from(certificate.len())
            .map_err(|_| PeerError::Protocol("certificate too large".to_string()))?;

        let mut body = Vec::with_capacity(RANDOM_LEN + 2 + certificate.len());
        body.extend_from_slice(&self.client_random);
        body.extend_from_slice(&cert_len.to_be_bytes());
        body.extend_from_slice(&certificate);

        let mut wire = Vec::new();
        handshake_record(CLIENT_HELLO, &body, &mut wire);
        self.send_raw(&wire)
    }

    /// Reads ServerHello and ServerFinished, verifying the latter.
    ///
    /// # Errors
    ///
    /// [`PeerError::Rejected`] on a server alert, [`PeerError::Closed`] on
    /// EOF, [`PeerError::Protocol`] on anything unexpected.
    pub fn read_server_flight(&mut self) -> Result<ServerFlight, PeerError> {
        let hello = self.read_handshake_message(SERVER_HELLO)?;
        if hello.len() != RANDOM_LEN + 8 + 2 + 1 {
            return Err(PeerError::Protocol(format!("server hello of {} bytes", hello.len())));
        }
        let server_random = &hello[..RANDOM_LEN];
        let mut generation = [0u8; 8];
        generation.copy_from_slice(&hello[RANDOM_LEN..RANDOM_LEN + 8]);
        let flight = ServerFlight {
            dh_generation: u64::from_be_bytes(generation),
            dh_bits: u16::from_be_bytes([hello[RANDOM_LEN + 8], hello[RANDOM_LEN + 9]]),
            certificate_requested: hello[RANDOM_LEN + 10] != 0,
        };

        let master =
            master_secret(&self.client_random, server_random, flight.dh_generation, flight.dh_bits);
        let verify = self.read_handshake_message(SERVER_FINISHED)?;
        if verify.len() != VERIFY_LEN || verify != finished(b"server finished", &master) {
            return Err(PeerError::Protocol("server finished does not verify".to_string()));
        }

        self.master = Some(master);
        self.channel = Some(SimChannel::new(client_write_key(&master), server_write_key(&master)));
        Ok(flight)
    }

    /// Sends ClientFinished.
    ///
    /// # Errors
    ///
    /// Transport failures, or [`PeerError::Protocol`] before the server
    /// flight was read.
    pub fn send_client_finished(&mut self) -> Result<(), PeerError> {
        let Some(master) = self.master else {
            return Err(PeerError::Protocol("server flight not read".to_string()));
        };
        let mut wire = Vec::new();
        handshake_record(CLIENT_FINISHED, &finished(b"client finished", &master), &mut wire);
        self.send_raw(&wire)
    }

    /// Sends application data, split at the record limit.
    ///
    /// # Errors
    ///
    /// Transport failures, or [`PeerError::Protocol`] before the handshake.
    pub fn send(&mut self, data: &[u8]) -> Result<(), PeerError> {
        let mut wire = Vec::new();
        let channel = self.channel_mut()?;
        for chunk in data.chunks(MAX_FRAGMENT_LEN) {
            channel.encrypt_record(chunk, &mut wire)?;
        }
        self.send_raw(&wire)
    }

    /// Sends a protected alert.
    ///
    /// # Errors
    ///
    /// As for [`SimPeer::send`].
    pub fn send_alert(&mut self, alert: Alert) -> Result<(), PeerError> {
        let mut wire = Vec::new();
        self.channel_mut()?.encrypt_alert(alert, &mut wire)?;
        self.send_raw(&wire)
    }

    /// Sends a protected close_notify.
    ///
    /// # Errors
    ///
    /// As for [`SimPeer::send`].
    pub fn send_close_notify(&mut self) -> Result<(), PeerError> {
        self.send_alert(Alert::close_notify())
    }

    /// Sends a heartbeat record, which the server treats as a warning.
    ///
    /// # Errors
    ///
    /// As for [`SimPeer::send`].
    pub fn send_heartbeat(&mut self) -> Result<(), PeerError> {
        let mut wire = Vec::new();
        self.channel_mut()?.encrypt_heartbeat(&mut wire)?;
        self.send_raw(&wire)
    }

    /// Sends `data` in a record whose last ciphertext byte is flipped.
    ///
    /// # Errors
    ///
    /// As for [`SimPeer::send`].
    pub fn send_corrupted(&mut self, data: &[u8]) -> Result<(), PeerError> {
        let mut wire = Vec::new();
        self.channel_mut()?.encrypt_record(data, &mut wire)?;
        if let Some(last) = wire.last_mut() {
            *last ^= 0x80;
        }
        self.send_raw(&wire)
    }

    /// Sends a plaintext alert record (valid only during the handshake).
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn send_plain_alert(&mut self, alert: Alert) -> Result<(), PeerError> {
        let mut wire = Vec::new();
        Record::new(ContentType::Alert, alert.to_bytes().to_vec())
            .encode(&mut wire)
            .map_err(|e| PeerError::Protocol(e.to_string()))?;
        self.send_raw(&wire)
    }

    /// Writes raw bytes.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn send_raw(&mut self, mut bytes: &[u8]) -> Result<(), PeerError> {
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => return Err(PeerError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Reads the next protected record.
    ///
    /// Heartbeat warnings are skipped.
    ///
    /// # Errors
    ///
    /// [`PeerError::Protocol`] on a record that fails to open.
    pub fn recv(&mut self) -> Result<PeerEvent, PeerError> {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return Err(PeerError::Protocol("handshake not complete".to_string()));
            };
            if let Some((opened, used)) = channel.decrypt_record(&self.inbound)? {
                self.inbound.drain(..used);
                match opened {
                    Opened::Data(data) => return Ok(PeerEvent::Data(data.to_vec())),
                    Opened::Alert(alert) => return Ok(PeerEvent::Alert(alert)),
                    Opened::Warning(_) | Opened::Ignored => continue,
                }
            }
            if !self.fill()? {
                return if self.inbound.is_empty() {
                    Ok(PeerEvent::Eof)
                } else {
                    Err(PeerError::Protocol("stream ended mid-record".to_string()))
                };
            }
        }
    }

    /// Reads application data until `len` bytes arrived.
    ///
    /// # Errors
    ///
    /// [`PeerError::Closed`] if an alert or EOF comes first.
    pub fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>, PeerError> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            match self.recv()? {
                PeerEvent::Data(chunk) => data.extend_from_slice(&chunk),
                PeerEvent::Alert(_) | PeerEvent::Eof => return Err(PeerError::Closed),
            }
        }
        Ok(data)
    }

    /// Reads until EOF, returning all data and every alert seen.
    ///
    /// # Errors
    ///
    /// Propagates [`SimPeer::recv`] failures.
    pub fn drain(&mut self) -> Result<(Vec<u8>, Vec<Alert>), PeerError> {
        let mut data = Vec::new();
        let mut alerts = Vec::new();
        loop {
            match self.recv()? {
                PeerEvent::Data(chunk) => data.extend_from_slice(&chunk),
                PeerEvent::Alert(alert) => alerts.push(alert),
                PeerEvent::Eof => return Ok((data, alerts)),
            }
        }
    }

    /// Closes the client stream.
    pub fn close(&mut self) {
        let _ = self.stream.close();
    }

    fn channel_mut(&mut self) -> Result<&mut SimChannel, PeerError> {
        self.channel.as_mut().ok_or_else(|| PeerError::Protocol("handshake not complete".to_string()))
    }

    /// Reads once into the inbound buffer. Returns `false` on EOF.
    fn fill(&mut self) -> Result<bool, PeerError> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.inbound.extend_from_slice(&buf[..n]);
                    return Ok(true);
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_handshake_message(&mut self, expected: u8) -> Result<Vec<u8>, PeerError> {
        loop {
            if let Some((record, used)) =
                Record::decode(&self.inbound).map_err(|e| PeerError::Protocol(e.to_string()))?
            {
                self.inbound.drain(..used);
                return match record.content_type {
                    ContentType::Alert => {
                        let alert = Alert::from_bytes(&record.fragment)
                            .map_err(|e| PeerError::Protocol(e.to_string()))?;
                        Err(PeerError::Rejected(alert))
                    },
                    ContentType::Handshake => match record.fragment.split_first() {
                        Some((&kind, body)) if kind == expected => Ok(body.to_vec()),
                        _ => Err(PeerError::Protocol(format!(
                            "expected handshake message {expected}"
                        ))),
                    },
                    other => Err(PeerError::Protocol(format!("unexpected {other:?} record"))),
                };
            }
            if !self.fill()? {
                return Err(PeerError::Closed);
            }
        }
    }
}
