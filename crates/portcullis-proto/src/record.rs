//! Record framing.
//!
//! Every byte a provider puts on the wire travels inside a record:
//!
//! ```text
//! +--------------+----------------+-------------+------------------+
//! | content type | legacy version | length (BE) | fragment ...     |
//! |    1 byte    |    2 bytes     |   2 bytes   | `length` bytes   |
//! +--------------+----------------+-------------+------------------+
//! ```
//!
//! The legacy version is written as `0x0303` and ignored on decode. The
//! fragment is opaque here; whether it is plaintext handshake data or
//! protected application data is up to the provider.

use bytes::{BufMut, Bytes};

use crate::errors::{ProtocolError, Result};

/// Size of the fixed record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Version field written into every header.
pub const LEGACY_VERSION: u16 = 0x0303;

/// Largest plaintext fragment a single record carries.
pub const MAX_FRAGMENT_LEN: usize = 16384;

/// Largest fragment accepted on decode (plaintext plus protection overhead).
pub const MAX_CIPHERTEXT_LEN: usize = MAX_FRAGMENT_LEN + 256;

/// Record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    /// Legacy middlebox-compatibility record
    ChangeCipherSpec = 20,
    /// Alert record
    Alert = 21,
    /// Handshake message
    Handshake = 22,
    /// Application data
    ApplicationData = 23,
}

impl ContentType {
    /// Parse a content type byte. Returns `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }

    /// Wire value of this content type.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Content type of the fragment that follows
    pub content_type: ContentType,
    /// Fragment length in bytes
    pub length: u16,
}

impl RecordHeader {
    /// Write the five header bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.content_type.to_u8());
        dst.put_u16(LEGACY_VERSION);
        dst.put_u16(self.length);
    }

    /// Parse a header from the front of `src`.
    ///
    /// Returns `Ok(None)` if fewer than [`RECORD_HEADER_LEN`] bytes are
    /// available.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidContentType`] for an unknown content type
    /// - [`ProtocolError::RecordTooLarge`] if the announced length exceeds
    ///   [`MAX_CIPHERTEXT_LEN`]
    pub fn decode(src: &[u8]) -> Result<Option<Self>> {
        if src.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }

        let content_type =
            ContentType::from_u8(src[0]).ok_or(ProtocolError::InvalidContentType(src[0]))?;
        let length = u16::from_be_bytes([src[3], src[4]]);

        if usize::from(length) > MAX_CIPHERTEXT_LEN {
            return Err(ProtocolError::RecordTooLarge {
                size: usize::from(length),
                max: MAX_CIPHERTEXT_LEN,
            });
        }

        Ok(Some(Self { content_type, length }))
    }
}

/// A complete record: header fields plus fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Content type
    pub content_type: ContentType,
    /// Opaque fragment bytes
    pub fragment: Bytes,
}

impl Record {
    /// Create a record.
    #[must_use]
    pub fn new(content_type: ContentType, fragment: impl Into<Bytes>) -> Self {
        Self { content_type, fragment: fragment.into() }
    }

    /// Number of bytes [`Record::encode`] writes.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.fragment.len()
    }

    /// Encode header and fragment into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::RecordTooLarge`] if the fragment exceeds
    /// [`MAX_CIPHERTEXT_LEN`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.fragment.len() > MAX_CIPHERTEXT_LEN {
            return Err(ProtocolError::RecordTooLarge {
                size: self.fragment.len(),
                max: MAX_CIPHERTEXT_LEN,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let length = self.fragment.len() as u16;

        RecordHeader { content_type: self.content_type, length }.encode(dst);
        dst.put_slice(&self.fragment);
        Ok(())
    }

    /// Decode one record from the front of `src`.
    ///
    /// Returns the record and the number of bytes it occupied, or `Ok(None)`
    /// if `src` does not yet hold a complete record.
    ///
    /// # Errors
    ///
    /// Propagates header errors from [`RecordHeader::decode`].
    pub fn decode(src: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(header) = RecordHeader::decode(src)? else {
            return Ok(None);
        };

        let total = RECORD_HEADER_LEN + usize::from(header.length);
        if src.len() < total {
            return Ok(None);
        }

        let fragment = Bytes::copy_from_slice(&src[RECORD_HEADER_LEN..total]);
        Ok(Some((Self { content_type: header.content_type, fragment }, total)))
    }
}
