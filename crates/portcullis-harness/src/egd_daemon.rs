//! In-process Entropy Gathering Daemon.
//!
//! Each `connect()` opens a loopback pair and serves the daemon end on its
//! own thread. All connections draw from one shared pool:
//!
//! - non-blocking reads return `min(requested, available)` bytes
//! - blocking reads return the full amount if the pool holds it; otherwise
//!   the daemon sends what it has and drops the connection, the way a
//!   daemon killed mid-wait would

use std::{
    io, thread,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use portcullis_core::{entropy::egd::EgdConnector, transport::ByteStream};
use portcullis_proto::egd::EgdRequest;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::trace;

use crate::loopback::{LoopbackStream, loopback_pair};

struct Pool {
    /// `None` means unlimited
    available: Option<usize>,
    rng: ChaCha20Rng,
    requests: Vec<EgdRequest>,
}

impl Pool {
    fn take(&mut self, wanted: usize) -> Vec<u8> {
        let n = self.available.map_or(wanted, |available| available.min(wanted));
        if let Some(available) = &mut self.available {
            *available -= n;
        }
        let mut bytes = vec![0u8; n];
        self.rng.fill_bytes(&mut bytes);
        bytes
    }
}

struct Daemon {
    pool: Mutex<Pool>,
    refuse: AtomicBool,
    connections: AtomicUsize,
}

/// Connector to a simulated daemon. Clones share the daemon.
#[derive(Clone)]
pub struct SimEgdConnector {
    daemon: Arc<Daemon>,
}

impl SimEgdConnector {
    /// Daemon with `available` bytes in its pool, or unlimited if `None`.
    pub fn new(seed: u64, available: Option<usize>) -> Self {
        Self {
            daemon: Arc::new(Daemon {
                pool: Mutex::new(Pool {
                    available,
                    rng: ChaCha20Rng::seed_from_u64(seed),
                    requests: Vec::new(),
                }),
                refuse: AtomicBool::new(false),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Daemon that refuses every connection.
    pub fn refusing() -> Self {
        let connector = Self::new(0, None);
        connector.set_refusing(true);
        connector
    }

    /// Starts or stops refusing connections.
    pub fn set_refusing(&self, refuse: bool) {
        self.daemon.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Refills the pool.
    pub fn set_available(&self, available: Option<usize>) {
        self.daemon.pool.lock().available = available;
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.daemon.connections.load(Ordering::SeqCst)
    }

    /// Every request served so far, in order.
    pub fn requests(&self) -> Vec<EgdRequest> {
        self.daemon.pool.lock().requests.clone()
    }
}

impl EgdConnector for SimEgdConnector {
    type Stream = LoopbackStream;

    fn connect(&mut self) -> io::Result<LoopbackStream> {
        if self.daemon.refuse.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        self.daemon.connections.fetch_add(1, Ordering::SeqCst);

        let (client, server) = loopback_pair();
        let daemon = Arc::clone(&self.daemon);
        thread::Builder::new()
            .name("sim-egd".to_string())
            .spawn(move || serve(&daemon, server))?;
        Ok(client)
    }
}

fn serve(daemon: &Daemon, mut stream: LoopbackStream) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 64];

    loop {
        let request = loop {
            match EgdRequest::decode(&pending) {
                Ok(Some((request, used))) => {
                    pending.drain(..used);
                    break request;
                },
                Ok(None) => {},
                Err(_) => return,
            }
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        };
        trace!(?request, "sim EGD request");

        let (reply, hang_up) = {
            let mut pool = daemon.pool.lock();
            pool.requests.push(request);
            match request {
                EgdRequest::EntropyLevel => {
                    let bits = pool.available.map_or(u32::MAX, |bytes| {
                        u32::try_from(bytes.saturating_mul(8)).unwrap_or(u32::MAX)
                    });
                    (bits.to_be_bytes().to_vec(), false)
                },
                EgdRequest::Read { len } => {
                    let bytes = pool.take(usize::from(len));
                    let mut reply = Vec::with_capacity(1 + bytes.len());
                    reply.push(bytes.len() as u8);
                    reply.extend_from_slice(&bytes);
                    (reply, false)
                },
                EgdRequest::ReadBlocking { len } => {
                    let bytes = pool.take(usize::from(len));
                    let short = bytes.len() < usize::from(len);
                    (bytes, short)
                },
            }
        };

        let mut rest = &reply[..];
        while !rest.is_empty() {
            match stream.write(rest) {
                Ok(n) if n > 0 => rest = &rest[n..],
                _ => return,
            }
        }
        if hang_up {
            let _ = stream.close();
            return;
        }
    }
}
