//! Entropy Gathering Daemon protocol.
//!
//! EGD speaks a tiny request/response protocol over a local stream socket.
//! Every request starts with a command byte:
//!
//! | Command | Request          | Response                             |
//! |---------|------------------|--------------------------------------|
//! | `0x00`  | -                | 4 bytes, big-endian entropy bits     |
//! | `0x01`  | 1 byte: `n`      | 1 byte: `k <= n`, then `k` bytes     |
//! | `0x02`  | 1 byte: `n`      | exactly `n` bytes (may block)        |
//! | `0x03`  | entropy to add   | -                                    |
//! | `0x04`  | -                | 1 byte length, then ASCII pid        |
//!
//! Lengths are a single byte, so one read request yields at most
//! [`MAX_READ_LEN`] bytes. Callers needing more issue several requests.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// Largest read a single request may ask for.
pub const MAX_READ_LEN: usize = 255;

/// Size of the [`EgdCommand::EntropyLevel`] response.
pub const ENTROPY_LEVEL_RESPONSE_LEN: usize = 4;

/// EGD command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EgdCommand {
    /// Query available entropy in bits
    EntropyLevel = 0x00,
    /// Read up to `n` bytes without blocking
    ReadNonBlocking = 0x01,
    /// Read exactly `n` bytes, blocking until available
    ReadBlocking = 0x02,
    /// Contribute entropy to the pool
    WriteEntropy = 0x03,
    /// Query the daemon's process id
    ProcessId = 0x04,
}

impl EgdCommand {
    /// Parse a command byte.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidEgdCommand`] for unknown values.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::EntropyLevel),
            0x01 => Ok(Self::ReadNonBlocking),
            0x02 => Ok(Self::ReadBlocking),
            0x03 => Ok(Self::WriteEntropy),
            0x04 => Ok(Self::ProcessId),
            other => Err(ProtocolError::InvalidEgdCommand(other)),
        }
    }

    /// Wire value of this command.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Requests a client sends to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgdRequest {
    /// How many bits of entropy does the pool hold?
    EntropyLevel,
    /// Give me up to `len` bytes now.
    Read {
        /// Requested byte count
        len: u8,
    },
    /// Give me exactly `len` bytes, waiting if necessary.
    ReadBlocking {
        /// Requested byte count
        len: u8,
    },
}

impl EgdRequest {
    /// Non-blocking read of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::EgdRequestTooLarge`] if `len` exceeds
    /// [`MAX_READ_LEN`].
    pub fn read(len: usize) -> Result<Self> {
        Ok(Self::Read { len: checked_len(len)? })
    }

    /// Blocking read of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::EgdRequestTooLarge`] if `len` exceeds
    /// [`MAX_READ_LEN`].
    pub fn read_blocking(len: usize) -> Result<Self> {
        Ok(Self::ReadBlocking { len: checked_len(len)? })
    }

    /// Command byte for this request.
    pub fn command(&self) -> EgdCommand {
        match self {
            Self::EntropyLevel => EgdCommand::EntropyLevel,
            Self::Read { .. } => EgdCommand::ReadNonBlocking,
            Self::ReadBlocking { .. } => EgdCommand::ReadBlocking,
        }
    }

    /// Write the request bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.command().to_u8());
        match self {
            Self::EntropyLevel => {},
            Self::Read { len } | Self::ReadBlocking { len } => dst.put_u8(*len),
        }
    }

    /// Parse a request from the front of `src` (daemon side).
    ///
    /// Returns the request and bytes consumed, or `Ok(None)` if incomplete.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidEgdCommand`] for commands a client
    /// should not be sending for reads.
    pub fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&command) = src.first() else {
            return Ok(None);
        };

        match EgdCommand::from_u8(command)? {
            EgdCommand::EntropyLevel => Ok(Some((Self::EntropyLevel, 1))),
            EgdCommand::ReadNonBlocking => Ok(src.get(1).map(|&len| (Self::Read { len }, 2))),
            EgdCommand::ReadBlocking => {
                Ok(src.get(1).map(|&len| (Self::ReadBlocking { len }, 2)))
            },
            other => Err(ProtocolError::InvalidEgdCommand(other.to_u8())),
        }
    }
}

fn checked_len(len: usize) -> Result<u8> {
    u8::try_from(len)
        .map_err(|_| ProtocolError::EgdRequestTooLarge { requested: len, max: MAX_READ_LEN })
}

/// Validate the count byte that prefixes a non-blocking read response.
///
/// # Errors
///
/// Returns [`ProtocolError::EgdResponseOverrun`] if the daemon announces more
/// bytes than were requested.
pub fn decode_read_count(requested: u8, announced: u8) -> Result<usize> {
    if announced > requested {
        return Err(ProtocolError::EgdResponseOverrun { requested, announced });
    }
    Ok(usize::from(announced))
}

/// Decode an entropy-level response (bits available in the pool).
pub fn decode_entropy_level(src: [u8; ENTROPY_LEVEL_RESPONSE_LEN]) -> u32 {
    u32::from_be_bytes(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_limited_to_one_byte_length() {
        assert_eq!(EgdRequest::read(255), Ok(EgdRequest::Read { len: 255 }));
        assert_eq!(
            EgdRequest::read(256),
            Err(ProtocolError::EgdRequestTooLarge { requested: 256, max: MAX_READ_LEN })
        );
        assert!(EgdRequest::read_blocking(1000).is_err());
    }

    #[test]
    fn request_decode_waits_for_length_byte() {
        assert_eq!(EgdRequest::decode(&[]), Ok(None));
        assert_eq!(EgdRequest::decode(&[0x01]), Ok(None));
        assert_eq!(EgdRequest::decode(&[0x01, 7, 0xaa]), Ok(Some((EgdRequest::Read { len: 7 }, 2))));
        assert_eq!(EgdRequest::decode(&[0x00]), Ok(Some((EgdRequest::EntropyLevel, 1))));
    }

    #[test]
    fn request_decode_rejects_non_read_commands() {
        assert_eq!(EgdRequest::decode(&[0x03, 1]), Err(ProtocolError::InvalidEgdCommand(0x03)));
        assert_eq!(EgdRequest::decode(&[0x09]), Err(ProtocolError::InvalidEgdCommand(0x09)));
    }

    #[test]
    fn read_count_never_exceeds_request() {
        assert_eq!(decode_read_count(16, 0), Ok(0));
        assert_eq!(decode_read_count(16, 16), Ok(16));
        assert_eq!(
            decode_read_count(16, 17),
            Err(ProtocolError::EgdResponseOverrun { requested: 16, announced: 17 })
        );
    }

    #[test]
    fn entropy_level_is_big_endian() {
        assert_eq!(decode_entropy_level([0, 0, 0x10, 0]), 4096);
    }
}
