//! Credential store validation and DH parameter rotation.
//!
//! Covers:
//! - rejection of unusable key material and security levels
//! - bounded, backed-off retries when entropy is unavailable
//! - copy-on-rotate snapshots under concurrent readers
//! - the background rotation worker

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use portcullis_core::{
    CredentialError, CredentialStore, SecurityLevel,
    config::CredentialConfig,
    credentials::{CertificateChain, PrivateKey, ServerCredentials},
    error::EntropyError,
    rotation::DhRotation,
};
use portcullis_harness::{
    FlakyRandom, SeededRandom, SimCrypto, SimEnv, StarvedRandom, fixture::Fixture,
};

fn initialize(
    credentials: ServerCredentials,
    level: SecurityLevel,
) -> Result<CredentialStore<SimEnv>, CredentialError> {
    CredentialStore::initialize(
        SimEnv::new(),
        credentials,
        level,
        CredentialConfig::default(),
        &SimCrypto::new(1),
        &mut SeededRandom::new(1),
    )
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn rejects_empty_chain() {
    let credentials = ServerCredentials {
        certificate_chain: CertificateChain::new(Vec::new()),
        private_key: PrivateKey::new(b"key".to_vec()),
    };
    assert!(matches!(
        initialize(credentials, SecurityLevel::Medium),
        Err(CredentialError::InvalidKeyMaterial(_))
    ));
}

#[test]
fn rejects_empty_key() {
    let credentials = ServerCredentials {
        certificate_chain: SimCrypto::credentials("server").certificate_chain,
        private_key: PrivateKey::new(Vec::new()),
    };
    assert!(matches!(
        initialize(credentials, SecurityLevel::Medium),
        Err(CredentialError::InvalidKeyMaterial(_))
    ));
}

#[test]
fn rejects_key_that_does_not_match_certificate() {
    let credentials = ServerCredentials {
        certificate_chain: SimCrypto::credentials("server").certificate_chain,
        private_key: SimCrypto::credentials("impostor").private_key,
    };
    assert!(matches!(
        initialize(credentials, SecurityLevel::Medium),
        Err(CredentialError::InvalidKeyMaterial(_))
    ));
}

#[test]
fn rejects_levels_without_parameters() {
    for level in [SecurityLevel::Insecure, SecurityLevel::Ultra] {
        let result = initialize(SimCrypto::credentials("server"), level);
        assert!(matches!(result, Err(CredentialError::UnsupportedSecurityLevel(l)) if l == level));
    }
}

#[test]
fn parameter_size_follows_security_level() {
    for (level, bits) in
        [(SecurityLevel::Legacy, 1024), (SecurityLevel::Medium, 2048), (SecurityLevel::High, 3072)]
    {
        let store = initialize(SimCrypto::credentials("server"), level).unwrap();
        let parameters = store.current_dh_parameters();
        assert_eq!(parameters.bits(), bits);
        assert_eq!(parameters.prime().len(), bits / 8);
        assert_eq!(parameters.prime()[0] & 0xC0, 0xC0);
        assert_eq!(parameters.prime()[bits / 8 - 1] & 1, 1);
        assert_eq!(parameters.generation(), 1);
        assert_eq!(store.security_level(), level);
    }
}

#[test]
fn initialize_gives_up_when_entropy_is_starved() {
    let starved = StarvedRandom::new();
    let env = SimEnv::new();
    let result = CredentialStore::initialize(
        env.clone(),
        SimCrypto::credentials("server"),
        SecurityLevel::Medium,
        CredentialConfig::default(),
        &SimCrypto::new(1),
        &mut starved.clone(),
    );

    assert!(matches!(result, Err(CredentialError::EntropyUnavailable { attempts: 5, .. })));
    assert_eq!(starved.attempts(), 5);
    assert_eq!(env.sleep_count(), 4);
}

#[test]
fn regeneration_failure_keeps_previous_parameters() {
    let fixture = Fixture::new(2);
    let before = fixture.store.current_dh_parameters();
    let starved = StarvedRandom::new();

    let err = fixture.store.regenerate_dh_parameters(&mut starved.clone()).unwrap_err();

    match err {
        CredentialError::EntropyUnavailable { attempts, source } => {
            assert_eq!(attempts, 5);
            assert!(matches!(source, EntropyError::Insufficient { received: 0, .. }));
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(starved.attempts(), 5);
    assert_eq!(fixture.env.sleep_count(), 4);
    assert_eq!(fixture.env.elapsed(), CredentialConfig::default().entropy_backoff * 4);
    assert!(Arc::ptr_eq(&before, &fixture.store.current_dh_parameters()));
}

#[test]
fn retry_bound_comes_from_config() {
    let config = CredentialConfig { entropy_attempts: 2, ..CredentialConfig::default() };
    let fixture = Fixture::with(3, SecurityLevel::Medium, config);
    let starved = StarvedRandom::new();

    let result = fixture.store.regenerate_dh_parameters(&mut starved.clone());
    assert!(matches!(result, Err(CredentialError::EntropyUnavailable { attempts: 2, .. })));
    assert_eq!(starved.attempts(), 2);
}

#[test]
fn transient_entropy_failures_are_retried() {
    let fixture = Fixture::new(4);
    let mut flaky = FlakyRandom::new(2, 9);

    fixture.store.regenerate_dh_parameters(&mut flaky).unwrap();

    assert_eq!(flaky.attempts(), 3);
    assert_eq!(fixture.store.current_dh_parameters().generation(), 2);
}

#[test]
fn rotation_replaces_rather_than_mutates() {
    let fixture = Fixture::new(5);
    let held = fixture.store.current_dh_parameters();
    let held_prime: Bytes = held.prime().clone();

    fixture.store.regenerate_dh_parameters(&mut SeededRandom::new(50)).unwrap();
    let current = fixture.store.current_dh_parameters();

    assert_eq!(held.generation(), 1);
    assert_eq!(held.prime(), &held_prime);
    assert_eq!(current.generation(), 2);
    assert_ne!(current.prime(), held.prime());
}

#[test]
fn rotation_due_tracks_virtual_clock() {
    let fixture = Fixture::new(6);
    let interval = CredentialConfig::default().rotation_interval;

    assert!(!fixture.store.rotation_due());
    fixture.env.advance(interval - Duration::from_secs(1));
    assert!(!fixture.store.rotation_due());
    fixture.env.advance(Duration::from_secs(1));
    assert!(fixture.store.rotation_due());

    fixture.store.regenerate_dh_parameters(&mut SeededRandom::new(60)).unwrap();
    assert!(!fixture.store.rotation_due());
}

#[test]
fn readers_never_observe_partial_parameters() {
    let fixture = Fixture::new(7);
    let store = Arc::clone(&fixture.store);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last_generation = 0;
                let mut reads = 0u64;
                while !done.load(Ordering::SeqCst) || reads == 0 {
                    let parameters = store.current_dh_parameters();
                    assert!(parameters.generation() >= last_generation);
                    assert_eq!(parameters.prime().len(), 256);
                    assert_eq!(parameters.prime()[0] & 0xC0, 0xC0);
                    last_generation = parameters.generation();
                    reads += 1;
                }
                last_generation
            })
        })
        .collect();

    let mut random = SeededRandom::new(70);
    for _ in 0..50 {
        store.regenerate_dh_parameters(&mut random).unwrap();
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.join().unwrap() <= 51);
    }
    assert_eq!(store.current_dh_parameters().generation(), 51);
}

#[test]
fn concurrent_regenerations_are_serialized() {
    let fixture = Fixture::new(8);
    let store = Arc::clone(&fixture.store);

    let writers: Vec<_> = (0..4u64)
        .map(|seed| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut random = SeededRandom::new(seed);
                for _ in 0..10 {
                    store.regenerate_dh_parameters(&mut random).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(store.current_dh_parameters().generation(), 41);
}

#[test]
fn worker_rotates_when_due() {
    let fixture = Fixture::new(9);
    let rotation =
        DhRotation::spawn(Arc::clone(&fixture.store), SeededRandom::new(90), Duration::from_millis(5))
            .unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(fixture.store.current_dh_parameters().generation(), 1);

    fixture.env.advance(CredentialConfig::default().rotation_interval);
    assert!(wait_until(Duration::from_secs(5), || {
        fixture.store.current_dh_parameters().generation() == 2
    }));
    assert!(!fixture.store.rotation_due());

    rotation.stop();
}

#[test]
fn worker_keeps_parameters_while_entropy_is_starved() {
    let config = CredentialConfig { entropy_attempts: 1, ..CredentialConfig::default() };
    let fixture = Fixture::with(10, SecurityLevel::Medium, config);
    let starved = StarvedRandom::new();
    let rotation =
        DhRotation::spawn(Arc::clone(&fixture.store), starved.clone(), Duration::from_millis(5))
            .unwrap();

    fixture.env.advance(Duration::from_secs(2 * 3600));
    assert!(wait_until(Duration::from_secs(5), || starved.attempts() >= 3));
    assert_eq!(fixture.store.current_dh_parameters().generation(), 1);
    assert!(fixture.store.rotation_due());

    drop(rotation);
}
