//! Ready-made server fixture for integration tests.

use std::{sync::Arc, thread};

use portcullis_core::{
    config::{CredentialConfig, HandshakeConfig, RecordConfig},
    credentials::{CredentialStore, SecurityLevel},
    handshake::{HandshakeEngine, PeerCertPolicy},
    record::RecordSession,
};

use crate::{LoopbackStream, SeededRandom, SimChannel, SimCrypto, SimEnv, SimPeer};

/// Name the fixture's server credentials are derived from.
pub const SERVER_NAME: &str = "portcullis.test";

/// Credential store, provider, and clock for one simulated server.
pub struct Fixture {
    /// Shared virtual clock
    pub env: SimEnv,
    /// Server credentials
    pub store: Arc<CredentialStore<SimEnv>>,
    /// Toy provider
    pub crypto: Arc<SimCrypto>,
}

impl Fixture {
    /// Medium-level fixture with default settings.
    ///
    /// # Panics
    ///
    /// Never in practice: the seeded source always delivers.
    pub fn new(seed: u64) -> Self {
        Self::with(seed, SecurityLevel::Medium, CredentialConfig::default())
    }

    /// Fixture with an explicit level and store settings.
    ///
    /// # Panics
    ///
    /// If `level` is not served.
    pub fn with(seed: u64, level: SecurityLevel, config: CredentialConfig) -> Self {
        let env = SimEnv::new();
        let crypto = SimCrypto::new(seed);
        let store = CredentialStore::initialize(
            env.clone(),
            SimCrypto::credentials(SERVER_NAME),
            level,
            config,
            &crypto,
            &mut SeededRandom::new(seed),
        )
        .expect("fixture credentials must load");
        Self { env, store: Arc::new(store), crypto: Arc::new(crypto) }
    }

    /// Runs a client handshake on its own thread against `server`, and
    /// returns both established ends.
    ///
    /// # Panics
    ///
    /// If either side of the handshake fails.
    pub fn establish<'a>(
        &'a self,
        server: &'a mut LoopbackStream,
        client: LoopbackStream,
        policy: PeerCertPolicy,
    ) -> (RecordSession<'a, LoopbackStream, SimChannel>, SimPeer) {
        self.establish_with(server, client, policy, &RecordConfig::default())
    }

    /// [`Fixture::establish`] with explicit record settings.
    ///
    /// # Panics
    ///
    /// If either side of the handshake fails.
    pub fn establish_with<'a>(
        &'a self,
        server: &'a mut LoopbackStream,
        client: LoopbackStream,
        policy: PeerCertPolicy,
        record: &RecordConfig,
    ) -> (RecordSession<'a, LoopbackStream, SimChannel>, SimPeer) {
        let client = thread::spawn(move || {
            let mut peer = SimPeer::new(client, 0x5eed);
            peer.handshake().map(|_| peer)
        });

        let mut engine = HandshakeEngine::new(
            server,
            &self.store,
            &*self.crypto,
            &HandshakeConfig::default(),
        )
        .with_peer_cert_policy(policy);
        engine.complete().expect("server handshake");
        let session = engine.into_session(record).expect("established");

        let peer = client.join().expect("client thread").expect("client handshake");
        (session, peer)
    }
}
