//! Toy negotiation and record protection.
//!
//! Handshake (one message per Handshake record, first byte is the type):
//!
//! ```text
//! client                                         server
//!   ClientHello  random[32] cert_len:u16 cert ──►
//!                ◄── ServerHello  random[32] dh_gen:u64 dh_bits:u16 cert_req:u8
//!                ◄── ServerFinished  verify[32]
//!   ClientFinished  verify[32]               ──►
//! ```
//!
//! Both sides derive a master value from the two randoms and the DH
//! generation and size, so a client can see which parameter snapshot its
//! handshake used.
//!
//! Protected records are ApplicationData records whose fragment is
//! `inner_type || payload` XORed with a SHA-256 keystream, followed by an
//! 8-byte SHA-256 tag. Sequence numbers feed both. This is a test fixture,
//! not a cipher.

use bytes::Bytes;
use parking_lot::Mutex;
use portcullis_core::{
    credentials::{CertificateChain, PrivateKey, ServerCredentials},
    crypto::{
        CryptoProvider, HandshakeContext, Negotiation, NegotiationError, NegotiationStep, Opened,
        RecordFault, SecureChannel,
    },
    handshake::PeerCertPolicy,
};
use portcullis_proto::{Alert, ContentType, Record};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

/// Client certificate the server side always rejects.
pub const REVOKED_CERTIFICATE: &[u8] = b"revoked";

pub(crate) const RANDOM_LEN: usize = 32;
pub(crate) const VERIFY_LEN: usize = 32;
const TAG_LEN: usize = 8;

pub(crate) const CLIENT_HELLO: u8 = 1;
pub(crate) const SERVER_HELLO: u8 = 2;
pub(crate) const SERVER_FINISHED: u8 = 3;
pub(crate) const CLIENT_FINISHED: u8 = 4;

const INNER_ALERT: u8 = 21;
const INNER_DATA: u8 = 23;
const INNER_HEARTBEAT: u8 = 24;

type Digest32 = [u8; 32];

fn hash(parts: &[&[u8]]) -> Digest32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub(crate) fn master_secret(
    client_random: &[u8],
    server_random: &[u8],
    dh_generation: u64,
    dh_bits: u16,
) -> Digest32 {
    hash(&[
        &b"sim master"[..],
        client_random,
        server_random,
        &dh_generation.to_be_bytes()[..],
        &dh_bits.to_be_bytes()[..],
    ])
}

pub(crate) fn finished(label: &[u8], master: &Digest32) -> Digest32 {
    hash(&[label, &master[..]])
}

pub(crate) fn client_write_key(master: &Digest32) -> Digest32 {
    hash(&[&b"client write"[..], &master[..]])
}

pub(crate) fn server_write_key(master: &Digest32) -> Digest32 {
    hash(&[&b"server write"[..], &master[..]])
}

/// One handshake message as a plaintext Handshake record.
pub(crate) fn handshake_record(kind: u8, body: &[u8], out: &mut Vec<u8>) {
    let mut fragment = Vec::with_capacity(1 + body.len());
    fragment.push(kind);
    fragment.extend_from_slice(body);
    // Handshake messages here are far below the record limit.
    let _ = Record::new(ContentType::Handshake, fragment).encode(out);
}

/// Toy provider. Key pairs match when the leaf certificate is the SHA-256 of
/// the private key.
pub struct SimCrypto {
    rng: Mutex<ChaCha20Rng>,
}

impl SimCrypto {
    /// Provider whose server randoms come from `seed`.
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)) }
    }

    /// Matching chain and key for `name`.
    pub fn credentials(name: &str) -> ServerCredentials {
        let key = name.as_bytes().to_vec();
        let leaf = Bytes::copy_from_slice(&hash(&[&key[..]]));
        ServerCredentials {
            certificate_chain: CertificateChain::new(vec![leaf, Bytes::from_static(b"sim root")]),
            private_key: PrivateKey::new(key),
        }
    }
}

impl CryptoProvider for SimCrypto {
    type Negotiation = SimNegotiation;
    type Channel = SimChannel;

    fn verify_key_pair(&self, chain: &CertificateChain, key: &PrivateKey) -> bool {
        chain.leaf().is_some_and(|leaf| leaf[..] == hash(&[key.expose_secret()]))
    }

    fn start_negotiation(&self) -> SimNegotiation {
        let mut server_random = [0u8; RANDOM_LEN];
        self.rng.lock().fill_bytes(&mut server_random);
        SimNegotiation { server_random, peer_certificate: None, stage: Stage::AwaitHello }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitHello,
    AwaitFinished(Digest32),
    Done(Digest32),
}

/// Server side of the toy handshake.
pub struct SimNegotiation {
    server_random: [u8; RANDOM_LEN],
    peer_certificate: Option<Bytes>,
    stage: Stage,
}

impl SimNegotiation {
    fn on_client_hello(
        &mut self,
        context: &HandshakeContext<'_>,
        body: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<(), NegotiationError> {
        if body.len() < RANDOM_LEN + 2 {
            return Err(NegotiationError::Malformed(format!("client hello of {} bytes", body.len())));
        }
        let (client_random, rest) = body.split_at(RANDOM_LEN);
        let cert_len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        let certificate = &rest[2..];
        if certificate.len() != cert_len {
            return Err(NegotiationError::Malformed("certificate length mismatch".to_string()));
        }

        if context.peer_cert_policy != PeerCertPolicy::None && !certificate.is_empty() {
            if certificate == REVOKED_CERTIFICATE {
                return Err(NegotiationError::CertificateRejected(
                    "client certificate revoked".to_string(),
                ));
            }
            self.peer_certificate = Some(Bytes::copy_from_slice(certificate));
        }

        let parameters = context.dh_parameters;
        let dh_bits = u16::try_from(parameters.bits())
            .map_err(|_| NegotiationError::Internal("DH size out of range".to_string()))?;
        let master =
            master_secret(client_random, &self.server_random, parameters.generation(), dh_bits);

        let mut hello = Vec::with_capacity(RANDOM_LEN + 11);
        hello.extend_from_slice(&self.server_random);
        hello.extend_from_slice(&parameters.generation().to_be_bytes());
        hello.extend_from_slice(&dh_bits.to_be_bytes());
        hello.push(u8::from(context.peer_cert_policy != PeerCertPolicy::None));
        handshake_record(SERVER_HELLO, &hello, output);
        handshake_record(SERVER_FINISHED, &finished(b"server finished", &master), output);

        self.stage = Stage::AwaitFinished(master);
        Ok(())
    }
}

impl Negotiation for SimNegotiation {
    type Channel = SimChannel;

    fn negotiate(
        &mut self,
        context: &HandshakeContext<'_>,
        input: &[u8],
    ) -> Result<NegotiationStep, NegotiationError> {
        let mut step = NegotiationStep::default();

        while let Some((record, used)) = Record::decode(&input[step.consumed..])
            .map_err(|e| NegotiationError::Malformed(e.to_string()))?
        {
            step.consumed += used;
            match record.content_type {
                ContentType::Handshake => {},
                ContentType::Alert => {
                    let alert = Alert::from_bytes(&record.fragment)
                        .map_err(|e| NegotiationError::Malformed(e.to_string()))?;
                    return Err(NegotiationError::PeerAlert(alert));
                },
                other => {
                    return Err(NegotiationError::UnexpectedMessage(format!(
                        "{other:?} record during handshake"
                    )));
                },
            }

            let Some((&kind, body)) = record.fragment.split_first() else {
                return Err(NegotiationError::Malformed("empty handshake message".to_string()));
            };

            match (self.stage, kind) {
                (Stage::AwaitHello, CLIENT_HELLO) => {
                    self.on_client_hello(context, body, &mut step.output)?;
                },
                (Stage::AwaitFinished(master), CLIENT_FINISHED) => {
                    if body != finished(b"client finished", &master).as_slice() {
                        return Err(NegotiationError::Malformed(
                            "client finished does not verify".to_string(),
                        ));
                    }
                    self.stage = Stage::Done(master);
                    step.complete = true;
                    return Ok(step);
                },
                (stage, kind) => {
                    return Err(NegotiationError::UnexpectedMessage(format!(
                        "handshake message {kind} while {stage:?}"
                    )));
                },
            }
        }

        Ok(step)
    }

    fn peer_certificate(&self) -> Option<&Bytes> {
        self.peer_certificate.as_ref()
    }

    fn derive_keys(self) -> Result<SimChannel, NegotiationError> {
        match self.stage {
            Stage::Done(master) => {
                Ok(SimChannel::new(server_write_key(&master), client_write_key(&master)))
            },
            stage => Err(NegotiationError::Internal(format!("derive_keys while {stage:?}"))),
        }
    }
}

/// Keyed record protection for one endpoint.
pub struct SimChannel {
    send_key: Digest32,
    recv_key: Digest32,
    send_seq: u64,
    recv_seq: u64,
}

impl SimChannel {
    /// Channel sending under `send_key` and receiving under `recv_key`.
    pub fn new(send_key: [u8; 32], recv_key: [u8; 32]) -> Self {
        Self { send_key, recv_key, send_seq: 0, recv_seq: 0 }
    }

    /// Protects a heartbeat record, which the receiver reports as a warning.
    ///
    /// # Errors
    ///
    /// As for `encrypt_record`.
    pub fn encrypt_heartbeat(&mut self, out: &mut Vec<u8>) -> Result<(), RecordFault> {
        self.seal(INNER_HEARTBEAT, b"", out)
    }

    fn seal(&mut self, inner_type: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<(), RecordFault> {
        if self.send_seq == u64::MAX {
            return Err(RecordFault::Exhausted("send sequence".to_string()));
        }
        let mut body = Vec::with_capacity(1 + payload.len() + TAG_LEN);
        body.push(inner_type);
        body.extend_from_slice(payload);
        apply_keystream(&self.send_key, self.send_seq, &mut body);
        let tag = record_tag(&self.send_key, self.send_seq, &body);
        body.extend_from_slice(&tag[..TAG_LEN]);

        Record::new(ContentType::ApplicationData, body)
            .encode(out)
            .map_err(|e| RecordFault::Protocol(e.to_string()))?;
        self.send_seq += 1;
        Ok(())
    }
}

fn apply_keystream(key: &Digest32, seq: u64, data: &mut [u8]) {
    for (block, chunk) in data.chunks_mut(32).enumerate() {
        let pad = hash(&[&key[..], &seq.to_be_bytes()[..], &(block as u64).to_be_bytes()[..]]);
        for (byte, k) in chunk.iter_mut().zip(pad) {
            *byte ^= k;
        }
    }
}

fn record_tag(key: &Digest32, seq: u64, body: &[u8]) -> Digest32 {
    hash(&[&b"tag"[..], &key[..], &seq.to_be_bytes()[..], body])
}

impl SecureChannel for SimChannel {
    fn encrypt_record(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), RecordFault> {
        self.seal(INNER_DATA, plaintext, out)
    }

    fn encrypt_alert(&mut self, alert: Alert, out: &mut Vec<u8>) -> Result<(), RecordFault> {
        self.seal(INNER_ALERT, &alert.to_bytes(), out)
    }

    fn decrypt_record(&mut self, input: &[u8]) -> Result<Option<(Opened, usize)>, RecordFault> {
        let Some((record, used)) =
            Record::decode(input).map_err(|e| RecordFault::Protocol(e.to_string()))?
        else {
            return Ok(None);
        };
        if record.content_type != ContentType::ApplicationData {
            return Err(RecordFault::Protocol(format!(
                "unprotected {:?} record",
                record.content_type
            )));
        }
        if record.fragment.len() < 1 + TAG_LEN {
            return Err(RecordFault::Protocol("protected record too short".to_string()));
        }

        let (body, tag) = record.fragment.split_at(record.fragment.len() - TAG_LEN);
        if record_tag(&self.recv_key, self.recv_seq, body)[..TAG_LEN] != *tag {
            return Err(RecordFault::Corrupted("bad record mac".to_string()));
        }

        let mut plain = body.to_vec();
        apply_keystream(&self.recv_key, self.recv_seq, &mut plain);
        self.recv_seq += 1;

        let opened = match plain[0] {
            INNER_DATA => Opened::Data(Bytes::from(plain).slice(1..)),
            INNER_ALERT => Opened::Alert(
                Alert::from_bytes(&plain[1..]).map_err(|e| RecordFault::Protocol(e.to_string()))?,
            ),
            INNER_HEARTBEAT => Opened::Warning("heartbeat record ignored".to_string()),
            other => {
                return Err(RecordFault::Protocol(format!("unknown inner content type {other}")));
            },
        };
        Ok(Some((opened, used)))
    }
}
