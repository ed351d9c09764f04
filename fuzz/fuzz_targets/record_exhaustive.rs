//! Exhaustive positive-space fuzzer for record framing.
//!
//! Random inputs rarely produce well-formed records, so this target walks
//! every content type against edge-case fragment sizes, using the input only
//! to choose fragment bytes and how the encoding is split across reads.

#![no_main]

use libfuzzer_sys::fuzz_target;
use portcullis_proto::{
    ContentType, Record,
    record::{MAX_CIPHERTEXT_LEN, MAX_FRAGMENT_LEN, RECORD_HEADER_LEN},
};

const ALL_CONTENT_TYPES: &[ContentType] = &[
    ContentType::ChangeCipherSpec,
    ContentType::Alert,
    ContentType::Handshake,
    ContentType::ApplicationData,
];

const FRAGMENT_SIZES: &[usize] = &[
    0,
    1,
    2, // alert
    255,
    256,
    MAX_FRAGMENT_LEN - 1,
    MAX_FRAGMENT_LEN,
    MAX_FRAGMENT_LEN + 1,
    MAX_CIPHERTEXT_LEN,
];

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let content_type = ALL_CONTENT_TYPES[usize::from(data[0]) % ALL_CONTENT_TYPES.len()];
    let split_seed = usize::from(data[1]);
    let body = &data[2..];

    for &size in FRAGMENT_SIZES {
        let fragment: Vec<u8> = body.iter().copied().cycle().take(size).collect();
        let fragment = if fragment.len() == size { fragment } else { vec![0u8; size] };
        let record = Record::new(content_type, fragment.clone());

        let mut wire = Vec::new();
        record.encode(&mut wire).expect("fragments up to the ciphertext limit encode");
        assert_eq!(wire.len(), RECORD_HEADER_LEN + size);

        // Any strict prefix is incomplete, never an error.
        let split = split_seed % wire.len();
        assert_eq!(Record::decode(&wire[..split]), Ok(None));

        let (decoded, used) = Record::decode(&wire)
            .expect("well-formed record decodes")
            .expect("complete record");
        assert_eq!(used, wire.len());
        assert_eq!(decoded.content_type, content_type);
        assert_eq!(decoded.fragment[..], fragment[..]);
    }

    // One byte over the limit is refused.
    let oversized = Record::new(content_type, vec![0u8; MAX_CIPHERTEXT_LEN + 1]);
    assert!(oversized.encode(&mut Vec::new()).is_err());
});
