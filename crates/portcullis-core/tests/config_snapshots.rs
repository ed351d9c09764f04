//! Snapshot of the default configuration.
//!
//! Changing a default changes deployed behavior; this makes it a reviewed
//! diff.

use portcullis_core::Config;

#[test]
fn default_config() {
    insta::assert_debug_snapshot!(Config::default(), @r#"
    Config {
        listen_address: "127.0.0.1:5556",
        security_level: Medium,
        peer_cert_policy: None,
        connection_model: Sequential,
        handshake: HandshakeConfig {
            timeout: 30s,
            read_chunk: 4096,
        },
        record: RecordConfig {
            receive_chunk: 16645,
            shutdown_timeout: 2s,
        },
        credentials: CredentialConfig {
            rotation_interval: 3600s,
            entropy_attempts: 5,
            entropy_backoff: 200ms,
        },
        entropy: EntropyConfig {
            egd_socket: None,
            max_reconnects: 3,
            max_rounds: 8,
        },
    }
    "#);
}
