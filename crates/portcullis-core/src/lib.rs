//! Portcullis session core
//!
//! This crate is the session-management shell of a TLS-terminating server:
//! everything between "a socket was accepted" and "the socket was closed",
//! with the cryptography itself delegated to a pluggable provider.
//!
//! # Architecture: "The Hollow Shell"
//!
//! The shell owns lifecycle and error classification. Everything with side
//! effects or cryptographic content sits behind a trait:
//!
//! ```text
//!        ┌──────────────────────────────────────────┐
//!        │ portcullis-core                          │
//!        │ - SessionManager (accept loop)           │
//!        │ - HandshakeEngine (Idle → Established)   │
//!        │ - RecordSession (send/receive/shutdown)  │
//!        │ - CredentialStore (copy-on-rotate DH)    │
//!        └──────────────────────────────────────────┘
//!           ↓            ↓             ↓          ↓
//!     ByteStream   CryptoProvider  RandomSource  Environment
//!     (TCP, Unix,  (negotiate,     (OS, EGD,     (clock,
//!      loopback)    records)        seeded)       sleep)
//! ```
//!
//! The harness crate (`portcullis-harness`) provides deterministic
//! implementations of each trait: a loopback stream, a toy provider with a
//! matching client, a scripted entropy daemon, and a virtual clock.
//!
//! # Key Principles
//!
//! - No crypto in the shell: negotiation and record protection go through
//!   [`crypto::CryptoProvider`]
//! - Containment: one connection's failure never touches another connection
//!   or the shared [`credentials::CredentialStore`]
//! - Exactly-once teardown: every accepted stream is closed once, whichever
//!   path the connection took
//!
//! # Modules
//!
//! - [`config`]: Listener configuration
//! - [`credentials`]: Certificate/key material and DH parameter rotation
//! - [`crypto`]: Provider traits (negotiation, record protection)
//! - [`entropy`]: Random sources (OS, EGD client)
//! - [`env`]: Environment abstraction (time)
//! - [`error`]: Error types per component
//! - [`handshake`]: Per-connection handshake state machine
//! - [`manager`]: Accept loop and connection scheduling
//! - [`record`]: Established session record I/O
//! - [`rotation`]: Background DH regeneration worker
//! - [`transport`]: Byte stream abstraction

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod crypto;
pub mod entropy;
pub mod env;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod record;
pub mod rotation;
pub mod transport;

pub use config::Config;
pub use credentials::{CredentialStore, DhParameterSet, SecurityLevel};
pub use error::{CredentialError, EntropyError, HandshakeError, ManagerError, RecordError};
pub use handshake::{HandshakeEngine, HandshakeOutcome, HandshakeState, PeerCertPolicy};
pub use manager::{EchoHandler, SessionHandler, SessionManager};
pub use record::{ReceiveOutcome, RecordSession, SessionState, ShutdownMode};
