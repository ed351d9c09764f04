//! In-memory blocking byte streams.
//!
//! A loopback pair behaves like a connected TCP socket pair:
//!
//! - `read` blocks until data arrives, returns `Ok(0)` once the other side
//!   closed and its data is drained, and fails with `ConnectionAborted`
//!   once this side was closed (including from a close handle)
//! - `write` fails with `BrokenPipe` once the other side closed
//! - dropping a stream closes it
//!
//! Non-blocking mode, a per-call write limit, and a receive window let tests
//! reach the `WouldBlock`, partial-write, and stalled-peer paths. Read
//! and write timeouts expire with `WouldBlock`, as Unix sockets do.

use std::{
    collections::VecDeque,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use portcullis_core::transport::{ByteStream, ByteStreamListener, CloseHandle};

#[derive(Debug, Default)]
struct PipeState {
    /// Bytes written by side `i`, waiting for side `1 - i`
    buffers: [VecDeque<u8>; 2],
    /// Cap on `buffers[i]`; a full buffer blocks side `i`'s writes
    limits: [Option<usize>; 2],
    closed: [bool; 2],
    close_calls: [usize; 2],
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    changed: Condvar,
}

impl Pipe {
    fn close_side(&self, side: usize) {
        self.state.lock().closed[side] = true;
        self.changed.notify_all();
    }

    /// Waits for a change, or fails once `deadline` has passed.
    fn wait(&self, state: &mut MutexGuard<'_, PipeState>, deadline: Option<Instant>) -> io::Result<()> {
        match deadline {
            None => self.changed.wait(state),
            Some(deadline) if Instant::now() >= deadline => {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out"));
            },
            Some(deadline) => {
                let _ = self.changed.wait_until(state, deadline);
            },
        }
        Ok(())
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// One end of an in-memory stream pair.
#[derive(Debug)]
pub struct LoopbackStream {
    pipe: Arc<Pipe>,
    side: usize,
    nonblocking: bool,
    max_write: Option<usize>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(40_000);

fn next_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, NEXT_PORT.fetch_add(1, Ordering::Relaxed)))
}

/// Connected stream pair: `(client, server)`.
pub fn loopback_pair() -> (LoopbackStream, LoopbackStream) {
    let pipe = Arc::new(Pipe::default());
    let client_addr = next_addr();
    let server_addr = next_addr();
    let end = |side, local_addr, peer_addr| LoopbackStream {
        pipe: Arc::clone(&pipe),
        side,
        nonblocking: false,
        max_write: None,
        read_timeout: None,
        write_timeout: None,
        local_addr,
        peer_addr,
    };
    (end(0, client_addr, server_addr), end(1, server_addr, client_addr))
}

impl LoopbackStream {
    /// Switches between blocking and non-blocking reads.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    /// Caps the bytes accepted per `write` call.
    pub fn set_max_write(&mut self, max_write: Option<usize>) {
        self.max_write = max_write.map(|n| n.max(1));
    }

    /// Caps how many unread bytes the other end may queue towards this one.
    /// `Some(0)` models a peer that stopped reading: the other end's writes
    /// block until the window opens again or their timeout expires.
    pub fn set_receive_window(&self, window: Option<usize>) {
        self.pipe.state.lock().limits[1 - self.side] = window;
        self.pipe.changed.notify_all();
    }

    /// Read timeout currently in force.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// This end's address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.pipe.state.lock().closed[self.side]
    }

    /// Whether the other end has been closed.
    pub fn is_peer_closed(&self) -> bool {
        self.pipe.state.lock().closed[1 - self.side]
    }

    /// How many times `ByteStream::close` was called on the other end.
    pub fn peer_close_calls(&self) -> usize {
        self.pipe.state.lock().close_calls[1 - self.side]
    }

    /// Bytes this end wrote that the other end has not read.
    pub fn unread_outbound(&self) -> usize {
        self.pipe.state.lock().buffers[self.side].len()
    }

    /// Blocks until the other end closes or `timeout` passes.
    pub fn wait_peer_closed(&self, timeout: Duration) -> bool {
        let mut state = self.pipe.state.lock();
        if !state.closed[1 - self.side] {
            let _ = self
                .pipe
                .changed
                .wait_while_for(&mut state, |s| !s.closed[1 - self.side], timeout);
        }
        state.closed[1 - self.side]
    }
}

impl ByteStream for LoopbackStream {
    type Closer = LoopbackCloser;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = deadline(self.read_timeout);
        let mut state = self.pipe.state.lock();
        loop {
            if state.closed[self.side] {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "stream closed"));
            }
            let incoming = &mut state.buffers[1 - self.side];
            if !incoming.is_empty() {
                let n = buf.len().min(incoming.len());
                for (dst, src) in buf.iter_mut().zip(incoming.drain(..n)) {
                    *dst = src;
                }
                self.pipe.changed.notify_all();
                return Ok(n);
            }
            if state.closed[1 - self.side] {
                return Ok(0);
            }
            if self.nonblocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.pipe.wait(&mut state, deadline)?;
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let deadline = deadline(self.write_timeout);
        let mut state = self.pipe.state.lock();
        loop {
            if state.closed[self.side] {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
            }
            if state.closed[1 - self.side] {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
            }
            let queued = state.buffers[self.side].len();
            let room = state.limits[self.side].map_or(usize::MAX, |cap| cap.saturating_sub(queued));
            if room > 0 || buf.is_empty() {
                let n = self.max_write.map_or(buf.len(), |max| max.min(buf.len())).min(room);
                state.buffers[self.side].extend(&buf[..n]);
                self.pipe.changed.notify_all();
                return Ok(n);
            }
            if self.nonblocking {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.pipe.wait(&mut state, deadline)?;
        }
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.pipe.state.lock();
        state.closed[self.side] = true;
        state.close_calls[self.side] += 1;
        self.pipe.changed.notify_all();
        Ok(())
    }

    fn close_handle(&self) -> io::Result<LoopbackCloser> {
        Ok(LoopbackCloser { pipe: Arc::clone(&self.pipe), side: self.side })
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.write_timeout = timeout;
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        self.pipe.close_side(self.side);
    }
}

/// Closes a [`LoopbackStream`] from another thread.
pub struct LoopbackCloser {
    pipe: Arc<Pipe>,
    side: usize,
}

impl CloseHandle for LoopbackCloser {
    fn close(&self) {
        self.pipe.close_side(self.side);
    }
}

type Pending = io::Result<LoopbackStream>;

/// Accepting end of an in-memory listener.
pub struct LoopbackListener {
    incoming: mpsc::Receiver<Pending>,
}

/// Connecting end of an in-memory listener. Cloneable.
#[derive(Clone)]
pub struct LoopbackConnector {
    outgoing: mpsc::Sender<Pending>,
}

/// Listener/connector pair. The listener fails with `NotConnected` once every
/// connector is dropped and the backlog is drained.
pub fn loopback_listener() -> (LoopbackListener, LoopbackConnector) {
    let (outgoing, incoming) = mpsc::channel();
    (LoopbackListener { incoming }, LoopbackConnector { outgoing })
}

impl LoopbackConnector {
    /// Connects, returning the client end.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` if the listener is gone.
    pub fn connect(&self) -> io::Result<LoopbackStream> {
        let (client, server) = loopback_pair();
        self.outgoing
            .send(Ok(server))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(client)
    }

    /// Makes the listener's next `accept` fail with `kind`.
    pub fn inject_accept_error(&self, kind: io::ErrorKind) {
        let _ = self.outgoing.send(Err(kind.into()));
    }
}

impl ByteStreamListener for LoopbackListener {
    type Stream = LoopbackStream;

    fn accept(&mut self) -> io::Result<LoopbackStream> {
        self.incoming.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::NotConnected, "all connectors dropped")
        })?
    }
}
