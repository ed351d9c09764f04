//! Listener configuration.
//!
//! All settings have defaults, so an empty TOML document (or
//! `Config::default()`) yields a working sequential listener on
//! `127.0.0.1:5556`.

use std::{io, net::TcpListener, path::PathBuf, time::Duration};

use portcullis_proto::record::{MAX_CIPHERTEXT_LEN, RECORD_HEADER_LEN};
use serde::{Deserialize, Serialize};

use crate::{credentials::SecurityLevel, handshake::PeerCertPolicy};

/// Top-level configuration for one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the TCP listener binds to
    pub listen_address: String,
    /// DH group size policy
    pub security_level: SecurityLevel,
    /// Whether to request or require client certificates
    pub peer_cert_policy: PeerCertPolicy,
    /// How accepted connections are scheduled
    pub connection_model: ConnectionModel,
    /// Handshake settings
    pub handshake: HandshakeConfig,
    /// Record-layer settings
    pub record: RecordConfig,
    /// Credential store settings
    pub credentials: CredentialConfig,
    /// Random source settings
    pub entropy: EntropyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:5556".to_string(),
            security_level: SecurityLevel::default(),
            peer_cert_policy: PeerCertPolicy::default(),
            connection_model: ConnectionModel::default(),
            handshake: HandshakeConfig::default(),
            record: RecordConfig::default(),
            credentials: CredentialConfig::default(),
            entropy: EntropyConfig::default(),
        }
    }
}

impl Config {
    /// Binds a TCP listener on `listen_address`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the address is invalid or in use.
    pub fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(&self.listen_address)
    }
}

/// Connection scheduling model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionModel {
    /// Serve each connection to completion on the accept thread
    #[default]
    Sequential,
    /// Spawn one OS thread per connection
    ThreadPerConnection,
    /// Run each connection on the ambient tokio runtime's blocking pool
    BlockingTasks,
}

/// Handshake settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Deadline measured from the first `advance()`
    pub timeout: Duration,
    /// Bytes read from the stream per `advance()`
    pub read_chunk: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), read_chunk: 4096 }
    }
}

/// Record-layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Bytes read from the stream per refill; one full protected record
    pub receive_chunk: usize,
    /// Longest a teardown write (close_notify, fatal alert) may block
    pub shutdown_timeout: Duration,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            receive_chunk: RECORD_HEADER_LEN + MAX_CIPHERTEXT_LEN,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Credential store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Age after which DH parameters are due for regeneration
    pub rotation_interval: Duration,
    /// Entropy fetch attempts per regeneration
    pub entropy_attempts: u32,
    /// Pause between entropy attempts
    pub entropy_backoff: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(60 * 60),
            entropy_attempts: 5,
            entropy_backoff: Duration::from_millis(200),
        }
    }
}

/// Random source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntropyConfig {
    /// EGD daemon socket; the OS generator is used when unset
    pub egd_socket: Option<PathBuf>,
    /// Reconnects the EGD client attempts per fill
    pub max_reconnects: u32,
    /// Request rounds without progress before the EGD client gives up
    pub max_rounds: u32,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self { egd_socket: None, max_reconnects: 3, max_rounds: 8 }
    }
}
