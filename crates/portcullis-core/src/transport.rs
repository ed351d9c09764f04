//! Byte stream abstraction for session I/O.
//!
//! The `ByteStream` trait abstracts over reliable, bidirectional, blocking
//! byte streams. The same handshake and record logic runs over:
//!
//! - **TCP sockets** (production, [`std::net::TcpStream`])
//! - **Unix sockets** (production and the EGD client)
//! - **Loopback pipes** (simulation, `portcullis-harness`)
//!
//! Streams are blocking by default. A stream in non-blocking mode signals
//! "not ready" with [`io::ErrorKind::WouldBlock`]; the handshake and record
//! layers surface that as "try again" instead of a failure.
//!
//! # Cancellation
//!
//! [`ByteStream::close_handle`] returns a [`CloseHandle`] that another thread
//! may use to close the stream. A blocked `read` or `write` on the owning
//! thread must return promptly with an error once the handle fires, and
//! that error must be `ConnectionAborted` so a local close is not mistaken
//! for the peer hanging up. OS sockets report a local `shutdown` as plain
//! EOF, so they are wrapped in a [`SocketStream`] that remembers it.
//!
//! # Timeouts
//!
//! [`ByteStream::set_read_timeout`] and [`ByteStream::set_write_timeout`]
//! bound blocking calls. An expired call fails with `WouldBlock` or
//! `TimedOut`, as the OS sockets do. Streams that cannot time out keep the
//! default no-op implementations.

use std::{
    fmt, io,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::debug;

/// Reliable, ordered, bidirectional byte stream.
///
/// # Invariants
///
/// - `read` returning `Ok(0)` means the peer closed its sending half
/// - `close` may be called more than once; only the first call has effect
pub trait ByteStream: Send {
    /// Handle used to close this stream from another thread.
    type Closer: CloseHandle;

    /// Reads into `buf`, returning the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning the number of bytes accepted.
    ///
    /// May accept fewer bytes than offered.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Closes both directions of the stream.
    fn close(&mut self) -> io::Result<()>;

    /// Returns a handle that closes this stream from another thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the underlying socket cannot be duplicated.
    fn close_handle(&self) -> io::Result<Self::Closer>;

    /// Bounds how long a blocking `read` waits. `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the timeout cannot be applied.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    /// Bounds how long a blocking `write` waits. `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the timeout cannot be applied.
    fn set_write_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    /// Remote address, for diagnostics only.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Cross-thread cancellation handle for a [`ByteStream`].
pub trait CloseHandle: Send + Sync + 'static {
    /// Closes the stream. Blocked operations on the owner return an error.
    fn close(&self);
}

/// Source of accepted streams.
pub trait ByteStreamListener {
    /// Stream type produced by `accept`.
    type Stream: ByteStream + 'static;

    /// Blocks until a connection arrives.
    ///
    /// # Errors
    ///
    /// Per-connection failures (aborted or reset handshakes) and fatal
    /// listener failures are both reported here. See
    /// [`is_transient_accept_error`] for the split.
    fn accept(&mut self) -> io::Result<Self::Stream>;
}

/// Whether an `accept` error concerns a single connection attempt rather than
/// the listener itself.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// Peer address wrapper with a stable `Display` for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer(pub Option<SocketAddr>);

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("unknown"),
        }
    }
}

/// Owning wrapper that makes `close` idempotent and closes on drop.
///
/// The session manager wraps every accepted stream in a guard so the
/// underlying stream is closed exactly once, whether the connection ended in
/// a handshake failure, a graceful shutdown, or a panic.
pub struct StreamGuard<S: ByteStream> {
    inner: S,
    closed: bool,
}

impl<S: ByteStream> StreamGuard<S> {
    /// Wraps an open stream.
    pub fn new(inner: S) -> Self {
        Self { inner, closed: false }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<S: ByteStream> ByteStream for StreamGuard<S> {
    type Closer = S::Closer;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        self.inner.write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close()
    }

    fn close_handle(&self) -> io::Result<Self::Closer> {
        self.inner.close_handle()
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_write_timeout(timeout)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl<S: ByteStream> Drop for StreamGuard<S> {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            debug!(%error, "stream close on drop failed");
        }
    }
}

/// Reads until `buf` is full.
///
/// # Errors
///
/// `UnexpectedEof` if the stream ends first; any other read error as-is.
pub(crate) fn read_exact<S: ByteStream + ?Sized>(stream: &mut S, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.read(buf) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes all of `buf`.
pub(crate) fn write_all<S: ByteStream + ?Sized>(stream: &mut S, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn shutdown_result(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

fn locally_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "stream closed locally")
}

/// OS socket that a [`SocketStream`] can wrap.
pub trait Socket: io::Read + io::Write + Send + Sync + Sized + 'static {
    /// Second handle to the same socket.
    fn duplicate(&self) -> io::Result<Self>;

    /// Shuts down both directions.
    fn shutdown_both(&self) -> io::Result<()>;

    /// Applies a read timeout; zero is not a valid OS timeout.
    fn apply_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Applies a write timeout; zero is not a valid OS timeout.
    fn apply_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Remote address, if the socket has one.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Zero means "no timeout" to the OS; clamp to the smallest real one.
fn os_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|t| t.max(Duration::from_millis(1)))
}

impl Socket for TcpStream {
    fn duplicate(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn apply_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, os_timeout(timeout))
    }

    fn apply_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, os_timeout(timeout))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

/// [`ByteStream`] over an OS socket.
///
/// Close handles set a shared flag before shutting the socket down. Once it
/// is set, reads and writes fail with `ConnectionAborted` instead of the
/// EOF or broken pipe the OS reports.
#[derive(Debug)]
pub struct SocketStream<T: Socket> {
    socket: T,
    closed_locally: Arc<AtomicBool>,
}

/// TCP connection.
pub type TcpConnection = SocketStream<TcpStream>;

impl<T: Socket> SocketStream<T> {
    /// Wraps a connected socket.
    pub fn new(socket: T) -> Self {
        Self { socket, closed_locally: Arc::new(AtomicBool::new(false)) }
    }

    /// The wrapped socket.
    pub fn get_ref(&self) -> &T {
        &self.socket
    }

    fn is_closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::Acquire)
    }
}

impl<T: Socket> From<T> for SocketStream<T> {
    fn from(socket: T) -> Self {
        Self::new(socket)
    }
}

impl<T: Socket> ByteStream for SocketStream<T> {
    type Closer = SocketCloser<T>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed_locally() {
            return Err(locally_closed());
        }
        match io::Read::read(&mut self.socket, buf) {
            Ok(0) | Err(_) if self.is_closed_locally() => Err(locally_closed()),
            other => other,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed_locally() {
            return Err(locally_closed());
        }
        match io::Write::write(&mut self.socket, buf) {
            Err(_) if self.is_closed_locally() => Err(locally_closed()),
            other => other,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        shutdown_result(self.socket.shutdown_both())
    }

    fn close_handle(&self) -> io::Result<Self::Closer> {
        Ok(SocketCloser {
            socket: self.socket.duplicate()?,
            closed_locally: Arc::clone(&self.closed_locally),
        })
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.apply_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.apply_write_timeout(timeout)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.remote_addr()
    }
}

/// Close handle for a [`SocketStream`] (a duplicated socket).
#[derive(Debug)]
pub struct SocketCloser<T: Socket> {
    socket: T,
    closed_locally: Arc<AtomicBool>,
}

impl<T: Socket> CloseHandle for SocketCloser<T> {
    fn close(&self) {
        self.closed_locally.store(true, Ordering::Release);
        let _ = self.socket.shutdown_both();
    }
}

impl ByteStreamListener for TcpListener {
    type Stream = TcpConnection;

    fn accept(&mut self) -> io::Result<TcpConnection> {
        TcpListener::accept(self).map(|(stream, _)| SocketStream::new(stream))
    }
}

#[cfg(unix)]
pub use self::unix::UnixConnection;

#[cfg(unix)]
mod unix {
    use std::{io, net::Shutdown, os::unix::net::UnixStream, time::Duration};

    use super::{Socket, SocketStream, os_timeout};

    /// Unix-domain stream connection.
    pub type UnixConnection = SocketStream<UnixStream>;

    impl Socket for UnixStream {
        fn duplicate(&self) -> io::Result<Self> {
            self.try_clone()
        }

        fn shutdown_both(&self) -> io::Result<()> {
            self.shutdown(Shutdown::Both)
        }

        fn apply_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            UnixStream::set_read_timeout(self, os_timeout(timeout))
        }

        fn apply_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            UnixStream::set_write_timeout(self, os_timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpConnection) {
        let mut listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let server = ByteStreamListener::accept(&mut listener).unwrap();
        (client, server)
    }

    #[test]
    fn tcp_round_trip_and_close_handle() {
        let (mut client, mut server) = tcp_pair();

        assert!(ByteStream::peer_addr(&server).is_some());
        write_all(&mut server, b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.close_handle().unwrap().close();
        client.write_all(b"x").ok();
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap_or(0), 0);
    }

    #[test]
    fn local_close_reads_as_aborted_not_eof() {
        let (_client, mut server) = tcp_pair();
        let closer = server.close_handle().unwrap();

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            let first = server.read(&mut buf).map_err(|e| e.kind());
            let second = server.write(b"late").map_err(|e| e.kind());
            (first, second)
        });
        std::thread::sleep(Duration::from_millis(50));
        closer.close();

        let (first, second) = reader.join().unwrap();
        assert_eq!(first, Err(io::ErrorKind::ConnectionAborted));
        assert_eq!(second, Err(io::ErrorKind::ConnectionAborted));
    }

    #[test]
    fn peer_close_still_reads_as_eof() {
        let (client, mut server) = tcp_pair();
        drop(client);
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_timeout_expires() {
        let (_client, mut server) = tcp_pair();
        server.set_read_timeout(Some(Duration::ZERO)).unwrap();
        let mut buf = [0u8; 8];
        let err = server.read(&mut buf).unwrap_err();
        assert!(matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut));
    }

    #[test]
    fn accept_error_classification() {
        assert!(is_transient_accept_error(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_transient_accept_error(&io::ErrorKind::Interrupted.into()));
        assert!(!is_transient_accept_error(&io::ErrorKind::PermissionDenied.into()));
        assert!(!is_transient_accept_error(&io::ErrorKind::InvalidInput.into()));
    }

    #[test]
    fn peer_display() {
        assert_eq!(Peer(None).to_string(), "unknown");
        assert_eq!(Peer(Some("10.0.0.1:443".parse().unwrap())).to_string(), "10.0.0.1:443");
    }
}
