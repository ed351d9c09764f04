//! Entropy Gathering Daemon client.
//!
//! Speaks the EGD socket protocol (see `portcullis_proto::egd`). A fill
//! proceeds in rounds of at most 255 bytes:
//!
//! 1. The first request of a fill is non-blocking (`0x01`); the daemon
//!    answers with whatever its pool holds, possibly nothing.
//! 2. Every later request is blocking (`0x02`) for the remaining shortfall.
//!
//! A broken connection is dropped and re-established on the next round.
//! Both the number of reconnects and the number of rounds without progress
//! are bounded, so a dead or starved daemon yields an error rather than an
//! endless loop.

use std::{
    io,
    path::{Path, PathBuf},
};

use portcullis_proto::{
    ProtocolError,
    egd::{self, ENTROPY_LEVEL_RESPONSE_LEN, EgdRequest, MAX_READ_LEN},
};
use tracing::{debug, warn};

use super::RandomSource;
use crate::{
    config::EntropyConfig,
    error::EntropyError,
    transport::{ByteStream, read_exact, write_all},
};

/// Opens connections to the daemon.
pub trait EgdConnector: Send {
    /// Stream type for one daemon connection.
    type Stream: ByteStream;

    /// Connects to the daemon.
    fn connect(&mut self) -> io::Result<Self::Stream>;
}

/// Connects to a daemon listening on a Unix-domain socket.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixSocketConnector {
    path: PathBuf,
}

#[cfg(unix)]
impl UnixSocketConnector {
    /// Connector for the socket at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

#[cfg(unix)]
impl EgdConnector for UnixSocketConnector {
    type Stream = crate::transport::UnixConnection;

    fn connect(&mut self) -> io::Result<Self::Stream> {
        std::os::unix::net::UnixStream::connect(&self.path).map(Into::into)
    }
}

/// Retry bounds for [`EgdClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgdConfig {
    /// Connection failures tolerated per operation
    pub max_reconnects: u32,
    /// Consecutive requests without progress tolerated per fill
    pub max_rounds: u32,
}

impl Default for EgdConfig {
    fn default() -> Self {
        Self::from(&EntropyConfig::default())
    }
}

impl From<&EntropyConfig> for EgdConfig {
    fn from(config: &EntropyConfig) -> Self {
        Self { max_reconnects: config.max_reconnects, max_rounds: config.max_rounds.max(1) }
    }
}

enum ExchangeError {
    Io(io::Error),
    Protocol(ProtocolError),
}

impl From<io::Error> for ExchangeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for ExchangeError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

/// EGD client holding at most one open daemon connection.
pub struct EgdClient<C: EgdConnector> {
    connector: C,
    config: EgdConfig,
    stream: Option<C::Stream>,
}

impl<C: EgdConnector> EgdClient<C> {
    /// Creates a client. No connection is made until first use.
    pub fn new(connector: C, config: EgdConfig) -> Self {
        Self { connector, config, stream: None }
    }

    /// Whether a daemon connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Asks the daemon how many bits of entropy its pool holds.
    ///
    /// # Errors
    ///
    /// [`EntropyError::Unreachable`] once the reconnect bound is exhausted.
    pub fn entropy_level(&mut self) -> Result<u32, EntropyError> {
        let mut failures = 0;
        loop {
            match self.query_level() {
                Ok(bits) => return Ok(bits),
                Err(ExchangeError::Protocol(err)) => {
                    self.disconnect();
                    return Err(err.into());
                },
                Err(ExchangeError::Io(err)) => {
                    self.disconnect();
                    failures += 1;
                    if failures > self.config.max_reconnects {
                        return Err(EntropyError::Unreachable {
                            attempts: failures,
                            reason: err.to_string(),
                        });
                    }
                    debug!(error = %err, failures, "EGD level query failed, reconnecting");
                },
            }
        }
    }

    fn query_level(&mut self) -> Result<u32, ExchangeError> {
        let stream = self.connection()?;
        send(stream, EgdRequest::EntropyLevel)?;
        let mut response = [0u8; ENTROPY_LEVEL_RESPONSE_LEN];
        read_exact(stream, &mut response)?;
        Ok(egd::decode_entropy_level(response))
    }

    fn connection(&mut self) -> io::Result<&mut C::Stream> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connector.connect()?,
        };
        Ok(self.stream.insert(stream))
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close();
        }
    }

    /// Issues one request for `target.len()` bytes (at most 255).
    ///
    /// Returns the bytes delivered even when the exchange failed partway.
    fn request(&mut self, target: &mut [u8], nonblocking: bool) -> (usize, Option<ExchangeError>) {
        let stream = match self.connection() {
            Ok(stream) => stream,
            Err(err) => return (0, Some(err.into())),
        };

        if nonblocking {
            let request = match EgdRequest::read(target.len()) {
                Ok(request) => request,
                Err(err) => return (0, Some(err.into())),
            };
            if let Err(err) = send(stream, request) {
                return (0, Some(err.into()));
            }
            let mut count = [0u8; 1];
            if let Err(err) = read_exact(stream, &mut count) {
                return (0, Some(err.into()));
            }
            let requested = target.len() as u8;
            match egd::decode_read_count(requested, count[0]) {
                Ok(announced) => read_available(stream, &mut target[..announced]),
                Err(err) => (0, Some(err.into())),
            }
        } else {
            let request = match EgdRequest::read_blocking(target.len()) {
                Ok(request) => request,
                Err(err) => return (0, Some(err.into())),
            };
            if let Err(err) = send(stream, request) {
                return (0, Some(err.into()));
            }
            read_available(stream, target)
        }
    }
}

impl<C: EgdConnector> RandomSource for EgdClient<C> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError> {
        let requested = buf.len();
        let mut filled = 0;
        let mut failures = 0;
        let mut stalled = 0;
        let mut nonblocking = true;

        while filled < requested {
            let end = requested.min(filled + MAX_READ_LEN);
            let (got, failure) = self.request(&mut buf[filled..end], nonblocking);
            filled += got;
            nonblocking = false;
            stalled = if got == 0 { stalled + 1 } else { 0 };

            match failure {
                None => {},
                Some(ExchangeError::Protocol(err)) => {
                    self.disconnect();
                    warn!(error = %err, "EGD daemon violated the protocol");
                    return Err(err.into());
                },
                Some(ExchangeError::Io(err)) => {
                    self.disconnect();
                    failures += 1;
                    if failures > self.config.max_reconnects {
                        return Err(EntropyError::Unreachable {
                            attempts: failures,
                            reason: err.to_string(),
                        });
                    }
                    debug!(error = %err, failures, filled, "EGD connection lost, reconnecting");
                },
            }

            if stalled >= self.config.max_rounds && filled < requested {
                return Err(EntropyError::Insufficient { requested, received: filled });
            }
        }
        Ok(())
    }
}

fn send<S: ByteStream>(stream: &mut S, request: EgdRequest) -> io::Result<()> {
    let mut wire = Vec::with_capacity(2);
    request.encode(&mut wire);
    write_all(stream, &wire)
}

/// Reads until `buf` is full, reporting partial progress on failure.
fn read_available<S: ByteStream>(stream: &mut S, buf: &mut [u8]) -> (usize, Option<ExchangeError>) {
    let mut read = 0;
    while read < buf.len() {
        match stream.read(&mut buf[read..]) {
            Ok(0) => return (read, Some(ExchangeError::Io(io::ErrorKind::UnexpectedEof.into()))),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return (read, Some(ExchangeError::Io(e))),
        }
    }
    (read, None)
}
