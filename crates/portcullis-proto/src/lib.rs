//! # Portcullis: Wire Codecs
//!
//! This crate holds the small amount of byte-level framing that the session
//! shell in `portcullis-core` and its providers share:
//!
//! - [`record`]: record framing (`content_type | length | fragment`) used by
//!   crypto providers to delimit handshake and application records
//! - [`alert`]: alert level/description pairs and their fatal vs. warning
//!   classification
//! - [`egd`]: the Entropy Gathering Daemon request/response protocol
//!
//! ## Scope
//!
//! None of this is a wire-exact TLS implementation. The record header keeps
//! the familiar five-byte shape so traces are easy to read, but the cipher
//! layout inside a fragment belongs to whichever `CryptoProvider` is in use.
//!
//! ## Security Properties
//!
//! - **Length checks first**: every decoder validates lengths before slicing.
//!   Truncated input is reported as "incomplete" (`Ok(None)`) where more bytes
//!   may still arrive, and as an error where the input is structurally wrong.
//!
//! - **Size Limits**: records larger than [`record::MAX_CIPHERTEXT_LEN`] are
//!   rejected so a peer cannot make us buffer unbounded data.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alert;
pub mod egd;
pub mod errors;
pub mod record;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use errors::{ProtocolError, Result};
pub use record::{ContentType, Record, RecordHeader};
