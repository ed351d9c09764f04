//! Random sources.
//!
//! DH parameter generation draws its randomness through [`RandomSource`].
//! Two production sources exist:
//!
//! - [`OsRandom`]: the operating system generator
//! - [`egd::EgdClient`]: an Entropy Gathering Daemon reached over a socket
//!
//! Sources are owned by whoever regenerates parameters (startup code or the
//! rotation worker) and are never shared between threads concurrently.

pub mod egd;

use rand::{RngCore, rngs::OsRng};

use crate::{config::EntropyConfig, error::EntropyError};

/// A supplier of random bytes.
pub trait RandomSource: Send {
    /// Fills `buf` completely.
    ///
    /// # Errors
    ///
    /// Returns an [`EntropyError`] if the source cannot deliver every byte.
    /// The contents of `buf` are unspecified on error.
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError>;
}

impl<R: RandomSource + ?Sized> RandomSource for &mut R {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError> {
        (**self).fill(buf)
    }
}

impl<R: RandomSource + ?Sized> RandomSource for Box<R> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError> {
        (**self).fill(buf)
    }
}

/// Operating system generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), EntropyError> {
        OsRng.try_fill_bytes(buf).map_err(|e| EntropyError::Source(e.to_string()))
    }
}

/// Opens the random source described by `config`.
///
/// An EGD socket path selects [`egd::EgdClient`]; no path selects
/// [`OsRandom`]. The EGD connection is made lazily on first use.
pub fn open_random_source(config: &EntropyConfig) -> Box<dyn RandomSource> {
    match &config.egd_socket {
        Some(path) => egd_source(path, config),
        None => Box::new(OsRandom),
    }
}

#[cfg(unix)]
fn egd_source(path: &std::path::Path, config: &EntropyConfig) -> Box<dyn RandomSource> {
    let connector = egd::UnixSocketConnector::new(path);
    Box::new(egd::EgdClient::new(connector, egd::EgdConfig::from(config)))
}

#[cfg(not(unix))]
fn egd_source(path: &std::path::Path, _config: &EntropyConfig) -> Box<dyn RandomSource> {
    tracing::warn!(path = %path.display(), "EGD sockets need Unix-domain sockets; using the OS generator");
    Box::new(OsRandom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_random_fills_buffer() {
        let mut buf = [0u8; 64];
        OsRandom.fill(&mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn default_config_uses_os_generator() {
        let mut source = open_random_source(&EntropyConfig::default());
        let mut buf = [0u8; 16];
        source.fill(&mut buf).unwrap();
    }
}
