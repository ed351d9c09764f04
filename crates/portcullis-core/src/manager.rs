//! Accept loop and connection scheduling.
//!
//! The [`SessionManager`] accepts streams from a [`ByteStreamListener`] and
//! drives each one through handshake, application handler, and teardown:
//!
//! ```text
//! accept ─► StreamGuard ─► HandshakeEngine ─► RecordSession ─► handler
//!                │               │ fail                          │
//!                │               ↓                               ↓
//!                └──────────── close (exactly once) ◄──── shutdown(Graceful)
//! ```
//!
//! # Containment
//!
//! A connection can fail in the handshake, fail in the record layer, or
//! panic in the handler. None of these reach the accept loop or another
//! connection: failures are logged and counted, panics are caught, and the
//! stream guard closes the stream on every path. Only a listener failure
//! ends the loop.
//!
//! # Scheduling
//!
//! See [`ConnectionModel`]. The shared [`CredentialStore`] is the only state
//! connections have in common, and it is safe for concurrent readers.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, ConnectionModel},
    credentials::CredentialStore,
    crypto::{CryptoProvider, SecureChannel},
    env::Environment,
    error::{HandshakeError, ManagerError, RecordError},
    handshake::HandshakeEngine,
    record::{ReceiveOutcome, RecordSession, ShutdownMode},
    transport::{ByteStream, ByteStreamListener, Peer, StreamGuard, is_transient_accept_error},
};

/// Application logic run over an established session.
///
/// The manager shuts the session down gracefully after `handle` returns, so
/// handlers only need to shut down when they want to stop early.
pub trait SessionHandler: Send + Sync + 'static {
    /// Serves one session until either side is done.
    fn handle<S: ByteStream, Ch: SecureChannel>(&self, session: &mut RecordSession<'_, S, Ch>);
}

/// Echoes every byte back until the peer closes.
#[derive(Debug, Clone, Copy)]
pub struct EchoHandler {
    /// Maximum bytes per receive
    pub chunk: usize,
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self { chunk: 4096 }
    }
}

impl SessionHandler for EchoHandler {
    fn handle<S: ByteStream, Ch: SecureChannel>(&self, session: &mut RecordSession<'_, S, Ch>) {
        loop {
            match session.receive(self.chunk) {
                Ok(ReceiveOutcome::Data(data)) => {
                    if let Err(err) = session.send_all(&data) {
                        debug!(peer = %session.peer(), error = %err, "echo send failed");
                        break;
                    }
                },
                Ok(ReceiveOutcome::PeerClosed) => break,
                Err(RecordError::Recoverable(_)) => {},
                Err(RecordError::WouldBlock) => thread::yield_now(),
                Err(err) => {
                    debug!(peer = %session.peer(), error = %err, "echo session ended");
                    break;
                },
            }
        }
        session.shutdown(ShutdownMode::Graceful);
    }
}

/// How one connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Handshake succeeded and the handler returned
    Completed,
    /// Handshake failed; the stream was closed
    HandshakeFailed(HandshakeError),
    /// Handler panicked; the stream was closed
    Panicked,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Streams accepted
    pub accepted: u64,
    /// Transient accept errors skipped
    pub accept_errors: u64,
    /// Handshakes that failed
    pub handshake_failures: u64,
    /// Sessions established
    pub established: u64,
    /// Sessions whose handler returned
    pub completed: u64,
    /// Connections whose handler panicked
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    accept_errors: AtomicU64,
    handshake_failures: AtomicU64,
    established: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Shared<C, E: Environment, H> {
    config: Config,
    credentials: Arc<CredentialStore<E>>,
    crypto: Arc<C>,
    handler: H,
    counters: Counters,
    next_connection_id: AtomicU64,
}

/// Accepts connections and runs each to completion.
pub struct SessionManager<C, E: Environment, H> {
    shared: Arc<Shared<C, E, H>>,
}

impl<C, E, H> SessionManager<C, E, H>
where
    C: CryptoProvider,
    E: Environment,
    H: SessionHandler,
{
    /// Creates a manager.
    pub fn new(
        config: Config,
        credentials: Arc<CredentialStore<E>>,
        crypto: Arc<C>,
        handler: H,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                credentials,
                crypto,
                handler,
                counters: Counters::default(),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Listener configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Shared credential store.
    pub fn credentials(&self) -> &Arc<CredentialStore<E>> {
        &self.shared.credentials
    }

    /// Current counters.
    pub fn stats(&self) -> ManagerStats {
        let c = &self.shared.counters;
        ManagerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            accept_errors: c.accept_errors.load(Ordering::Relaxed),
            handshake_failures: c.handshake_failures.load(Ordering::Relaxed),
            established: c.established.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
        }
    }

    /// Accepts and serves connections until the listener fails.
    ///
    /// Transient accept errors (aborted or reset connection attempts,
    /// interrupts, timeouts) are logged and skipped.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::NoRuntime`] if the model is
    ///   [`ConnectionModel::BlockingTasks`] and no tokio runtime is current
    /// - [`ManagerError::Listener`] when `accept` fails for good
    pub fn accept_loop<L: ByteStreamListener>(&self, listener: &mut L) -> Result<(), ManagerError> {
        let model = self.shared.config.connection_model;
        let runtime = match model {
            ConnectionModel::BlockingTasks => Some(
                tokio::runtime::Handle::try_current().map_err(|_| ManagerError::NoRuntime)?,
            ),
            ConnectionModel::Sequential | ConnectionModel::ThreadPerConnection => None,
        };
        info!(?model, "accept loop started");

        loop {
            let stream = match listener.accept() {
                Ok(stream) => stream,
                Err(err) if is_transient_accept_error(&err) => {
                    bump(&self.shared.counters.accept_errors);
                    warn!(error = %err, "accept failed; continuing");
                    continue;
                },
                Err(err) => {
                    error!(error = %err, "listener failed; stopping accept loop");
                    return Err(ManagerError::Listener(err));
                },
            };
            self.dispatch(StreamGuard::new(stream), runtime.as_ref());
        }
    }

    /// Serves one accepted stream on the calling thread.
    ///
    /// The stream is closed exactly once before this returns.
    pub fn serve_connection<S: ByteStream>(&self, stream: S) -> ConnectionOutcome {
        let id = self.shared.next_id();
        bump(&self.shared.counters.accepted);
        self.shared.serve(id, StreamGuard::new(stream))
    }

    fn dispatch<S: ByteStream + 'static>(
        &self,
        stream: StreamGuard<S>,
        runtime: Option<&tokio::runtime::Handle>,
    ) {
        let id = self.shared.next_id();
        bump(&self.shared.counters.accepted);

        match (self.shared.config.connection_model, runtime) {
            (ConnectionModel::ThreadPerConnection, _) => {
                let shared = Arc::clone(&self.shared);
                let spawned = thread::Builder::new()
                    .name(format!("portcullis-conn-{id}"))
                    .spawn(move || shared.serve(id, stream));
                if let Err(err) = spawned {
                    warn!(connection_id = id, error = %err, "could not spawn connection thread");
                }
            },
            (ConnectionModel::BlockingTasks, Some(runtime)) => {
                let shared = Arc::clone(&self.shared);
                drop(runtime.spawn_blocking(move || shared.serve(id, stream)));
            },
            (ConnectionModel::Sequential | ConnectionModel::BlockingTasks, _) => {
                self.shared.serve(id, stream);
            },
        }
    }
}

impl<C, E, H> Shared<C, E, H>
where
    C: CryptoProvider,
    E: Environment,
    H: SessionHandler,
{
    fn next_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    fn serve<S: ByteStream>(&self, id: u64, mut stream: StreamGuard<S>) -> ConnectionOutcome {
        let peer = Peer(stream.peer_addr());
        debug!(connection_id = id, %peer, "connection accepted");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(id, peer, &mut stream)))
            .unwrap_or_else(|_| {
                bump(&self.counters.panicked);
                error!(connection_id = id, %peer, "connection handler panicked");
                ConnectionOutcome::Panicked
            });

        if let Err(err) = stream.close() {
            debug!(connection_id = id, %peer, error = %err, "stream close failed");
        }
        outcome
    }

    fn run<S: ByteStream>(&self, id: u64, peer: Peer, stream: &mut S) -> ConnectionOutcome {
        let engine = HandshakeEngine::new(
            stream,
            &self.credentials,
            &*self.crypto,
            &self.config.handshake,
        )
        .with_peer_cert_policy(self.config.peer_cert_policy);

        let session = establish(engine, &self.config);
        let mut session = match session {
            Ok(session) => session,
            Err(err) => {
                bump(&self.counters.handshake_failures);
                warn!(connection_id = id, %peer, kind = err.kind(), error = %err, "handshake failed");
                return ConnectionOutcome::HandshakeFailed(err);
            },
        };

        bump(&self.counters.established);
        info!(connection_id = id, %peer, "session established");

        self.handler.handle(&mut session);
        session.shutdown(ShutdownMode::Graceful);

        bump(&self.counters.completed);
        debug!(connection_id = id, %peer, "connection closed");
        ConnectionOutcome::Completed
    }
}

fn establish<'a, S, C, E>(
    mut engine: HandshakeEngine<'a, S, C, E>,
    config: &Config,
) -> Result<RecordSession<'a, S, C::Channel>, HandshakeError>
where
    S: ByteStream,
    C: CryptoProvider,
    E: Environment,
{
    engine.complete()?;
    engine.into_session(&config.record)
}
