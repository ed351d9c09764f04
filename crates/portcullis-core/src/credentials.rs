//! Server credentials and DH parameter rotation.
//!
//! A [`CredentialStore`] is created once at startup and shared by every
//! connection through an `Arc`. The certificate chain and private key are
//! immutable for the store's lifetime. The DH parameter set is replaced
//! wholesale by [`CredentialStore::regenerate_dh_parameters`]:
//!
//! ```text
//!   current ──► Arc<DhParameterSet gen N> ◄── handshakes started before
//!      │
//!      │ regenerate (new set built off-lock, then pointer swap)
//!      ▼
//!   current ──► Arc<DhParameterSet gen N+1> ◄── handshakes started after
//! ```
//!
//! # Invariants
//!
//! - Readers never observe a partially built parameter set
//! - A handshake keeps the snapshot it took, even across a rotation
//! - Generation numbers strictly increase
//! - A failed regeneration leaves the previous set in place

use std::{fmt, sync::Arc};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    config::CredentialConfig,
    crypto::CryptoProvider,
    entropy::RandomSource,
    env::Environment,
    error::CredentialError,
};

/// DH group size policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Export-grade groups; never served
    Insecure,
    /// 1024-bit groups for old clients
    Legacy,
    /// 2048-bit groups
    #[default]
    Medium,
    /// 3072-bit groups
    High,
    /// Groups larger than this server generates
    Ultra,
}

impl SecurityLevel {
    /// DH modulus size for this level, if the level is served.
    pub fn dh_bits(self) -> Option<usize> {
        match self {
            Self::Legacy => Some(1024),
            Self::Medium => Some(2048),
            Self::High => Some(3072),
            Self::Insecure | Self::Ultra => None,
        }
    }
}

/// Certificate chain, leaf first. Opaque DER blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain(Vec<Bytes>);

impl CertificateChain {
    /// Chain from certificates ordered leaf first.
    pub fn new(certificates: Vec<Bytes>) -> Self {
        Self(certificates)
    }

    /// End-entity certificate.
    pub fn leaf(&self) -> Option<&Bytes> {
        self.0.first()
    }

    /// All certificates, leaf first.
    pub fn certificates(&self) -> &[Bytes] {
        &self.0
    }

    /// Whether the chain holds no certificates.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Private key bytes. Wiped on drop; never printed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// Takes ownership of key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw key bytes, for providers only.
    ///
    /// # Security
    ///
    /// Callers must not log, copy into long-lived buffers, or send these
    /// bytes anywhere.
    pub fn expose_secret(&self) -> &[u8] {
        &self.0
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED; {} bytes])", self.0.len())
    }
}

/// Certificate chain and matching private key, as loaded from storage.
#[derive(Debug)]
pub struct ServerCredentials {
    /// Chain presented to clients
    pub certificate_chain: CertificateChain,
    /// Key for the leaf certificate
    pub private_key: PrivateKey,
}

/// One immutable generation of DH parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParameterSet {
    bits: usize,
    generator: u32,
    prime: Bytes,
    generation: u64,
}

impl DhParameterSet {
    /// Generator used for every set.
    pub const GENERATOR: u32 = 2;

    /// Builds a modulus-shaped value from `bits / 8` random bytes.
    ///
    /// The top two bits are set so the value has exactly `bits` bits and the
    /// product of two such values is full width; the low bit is set so the
    /// value is odd. Primality is the provider's concern.
    fn from_entropy(bits: usize, material: &[u8], generation: u64) -> Self {
        let mut prime = material.to_vec();
        if let Some(first) = prime.first_mut() {
            *first |= 0xC0;
        }
        if let Some(last) = prime.last_mut() {
            *last |= 0x01;
        }
        Self { bits, generator: Self::GENERATOR, prime: Bytes::from(prime), generation }
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Group generator.
    pub fn generator(&self) -> u32 {
        self.generator
    }

    /// Big-endian modulus.
    pub fn prime(&self) -> &Bytes {
        &self.prime
    }

    /// Monotonic generation number, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct DhSnapshot<I> {
    parameters: Arc<DhParameterSet>,
    generated_at: I,
}

/// Process-wide server credentials.
///
/// # Concurrency
///
/// `current_dh_parameters` takes a read lock only long enough to clone an
/// `Arc`. Regeneration builds the new set without holding that lock, then
/// swaps the pointer under a brief write lock. Concurrent regenerations are
/// serialized.
pub struct CredentialStore<E: Environment> {
    env: E,
    config: CredentialConfig,
    certificate_chain: CertificateChain,
    private_key: PrivateKey,
    security_level: SecurityLevel,
    dh_bits: usize,
    current: RwLock<DhSnapshot<E::Instant>>,
    regeneration: Mutex<()>,
}

impl<E: Environment> CredentialStore<E> {
    /// Validates credentials and generates the first DH parameter set.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::InvalidKeyMaterial`] if the chain or key is empty
    ///   or the key does not match the leaf certificate
    /// - [`CredentialError::UnsupportedSecurityLevel`] for `Insecure`/`Ultra`
    /// - [`CredentialError::EntropyUnavailable`] if the random source fails
    ///   past the retry bound
    pub fn initialize<C, R>(
        env: E,
        credentials: ServerCredentials,
        security_level: SecurityLevel,
        config: CredentialConfig,
        crypto: &C,
        random: &mut R,
    ) -> Result<Self, CredentialError>
    where
        C: CryptoProvider,
        R: RandomSource + ?Sized,
    {
        let ServerCredentials { certificate_chain, private_key } = credentials;

        if certificate_chain.is_empty() {
            return Err(CredentialError::InvalidKeyMaterial("empty certificate chain".to_string()));
        }
        if private_key.is_empty() {
            return Err(CredentialError::InvalidKeyMaterial("empty private key".to_string()));
        }
        if !crypto.verify_key_pair(&certificate_chain, &private_key) {
            return Err(CredentialError::InvalidKeyMaterial(
                "private key does not match leaf certificate".to_string(),
            ));
        }

        let dh_bits = security_level
            .dh_bits()
            .ok_or(CredentialError::UnsupportedSecurityLevel(security_level))?;

        let parameters = generate(&env, &config, dh_bits, 1, random)?;
        let generated_at = env.now();
        info!(
            ?security_level,
            dh_bits,
            chain_len = certificate_chain.certificates().len(),
            "credential store initialized"
        );

        Ok(Self {
            env,
            config,
            certificate_chain,
            private_key,
            security_level,
            dh_bits,
            current: RwLock::new(DhSnapshot { parameters: Arc::new(parameters), generated_at }),
            regeneration: Mutex::new(()),
        })
    }

    /// Current DH parameter set.
    ///
    /// The returned `Arc` stays valid for as long as the caller holds it,
    /// whatever rotations happen meanwhile.
    pub fn current_dh_parameters(&self) -> Arc<DhParameterSet> {
        Arc::clone(&self.current.read().parameters)
    }

    /// When the current DH parameter set was generated.
    pub fn dh_generated_at(&self) -> E::Instant {
        self.current.read().generated_at
    }

    /// Whether the current set is older than the rotation interval.
    pub fn rotation_due(&self) -> bool {
        self.env.now() - self.dh_generated_at() >= self.config.rotation_interval
    }

    /// Generates a new DH parameter set and makes it current.
    ///
    /// Handshakes already holding a snapshot keep using it.
    ///
    /// # Errors
    ///
    /// [`CredentialError::EntropyUnavailable`] if the random source fails
    /// `entropy_attempts` times. The previous set stays current and an
    /// error-level event is logged.
    pub fn regenerate_dh_parameters<R>(&self, random: &mut R) -> Result<(), CredentialError>
    where
        R: RandomSource + ?Sized,
    {
        let _serialized = self.regeneration.lock();
        let previous = self.current_dh_parameters();

        match generate(&self.env, &self.config, self.dh_bits, previous.generation() + 1, random) {
            Ok(parameters) => {
                let generation = parameters.generation();
                let generated_at = self.env.now();
                *self.current.write() =
                    DhSnapshot { parameters: Arc::new(parameters), generated_at };
                info!(generation, dh_bits = self.dh_bits, "DH parameters rotated");
                Ok(())
            },
            Err(err) => {
                error!(
                    error = %err,
                    generation = previous.generation(),
                    "DH parameter regeneration failed; keeping previous parameters"
                );
                Err(err)
            },
        }
    }

    /// Certificate chain served to clients.
    pub fn certificate_chain(&self) -> &CertificateChain {
        &self.certificate_chain
    }

    /// Private key for the leaf certificate.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Configured security level.
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// Environment the store reads time from.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Store settings.
    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }
}

impl<E: Environment> fmt::Debug for CredentialStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("security_level", &self.security_level)
            .field("dh_generation", &self.current.read().parameters.generation())
            .field("private_key", &self.private_key)
            .finish_non_exhaustive()
    }
}

fn generate<E, R>(
    env: &E,
    config: &CredentialConfig,
    bits: usize,
    generation: u64,
    random: &mut R,
) -> Result<DhParameterSet, CredentialError>
where
    E: Environment,
    R: RandomSource + ?Sized,
{
    let attempts = config.entropy_attempts.max(1);
    let mut material = Zeroizing::new(vec![0u8; bits / 8]);
    let mut attempt = 1;

    loop {
        match random.fill(&mut material) {
            Ok(()) => return Ok(DhParameterSet::from_entropy(bits, &material, generation)),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, attempts, error = %err, "entropy fetch failed, retrying");
                env.sleep(config.entropy_backoff);
                attempt += 1;
            },
            Err(source) => {
                return Err(CredentialError::EntropyUnavailable { attempts: attempt, source });
            },
        }
    }
}
