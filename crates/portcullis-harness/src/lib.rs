//! Deterministic simulation harness for portcullis testing.
//!
//! This crate provides in-process implementations of every trait the session
//! core depends on, so whole connections (accept, handshake, record I/O,
//! teardown) run inside one test process with reproducible results:
//!
//! - [`SimEnv`]: virtual clock; `sleep` advances time instantly
//! - [`loopback_pair`] / [`loopback_listener`]: blocking in-memory streams
//!   with close handles, non-blocking mode, and fault injection
//! - [`SimCrypto`] and [`SimPeer`]: a toy negotiation and record protection
//!   scheme, plus the client that speaks it
//! - [`SimEgdConnector`]: an entropy daemon with a finite, scriptable pool
//! - [`SeededRandom`], [`StarvedRandom`], [`FlakyRandom`]: random sources
//! - [`fixture::Fixture`]: credential store, provider, and clock in one
//!
//! None of this is cryptographically meaningful.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod egd_daemon;
pub mod fixture;
mod loopback;
mod random;
mod sim_crypto;
mod sim_env;
mod sim_peer;

pub use egd_daemon::SimEgdConnector;
pub use loopback::{
    LoopbackCloser, LoopbackConnector, LoopbackListener, LoopbackStream, loopback_listener,
    loopback_pair,
};
pub use random::{FlakyRandom, SeededRandom, StarvedRandom};
pub use sim_crypto::{REVOKED_CERTIFICATE, SimChannel, SimCrypto, SimNegotiation};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_peer::{PeerError, PeerEvent, ServerFlight, SimPeer};
