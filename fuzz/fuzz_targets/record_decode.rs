//! Arbitrary bytes into every decoder that faces the network.
//!
//! Decoders must never panic, and whatever they accept must re-encode to the
//! bytes they consumed (the legacy version field aside).

#![no_main]

use libfuzzer_sys::fuzz_target;
use portcullis_proto::{
    Alert, Record,
    egd::EgdRequest,
    record::{MAX_CIPHERTEXT_LEN, RECORD_HEADER_LEN},
};

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok(Some((record, used))) = Record::decode(rest) {
        assert_eq!(used, RECORD_HEADER_LEN + record.fragment.len());
        assert!(record.fragment.len() <= MAX_CIPHERTEXT_LEN);

        let mut encoded = Vec::with_capacity(used);
        record.encode(&mut encoded).expect("decoded record must re-encode");
        assert_eq!(encoded[0], rest[0]);
        assert_eq!(encoded[3..], rest[3..used]);

        if record.fragment.len() == Alert::LEN {
            if let Ok(alert) = Alert::from_bytes(&record.fragment) {
                assert_eq!(alert.to_bytes()[..], record.fragment[..]);
            }
        }
        rest = &rest[used..];
    }

    let mut rest = data;
    while let Ok(Some((request, used))) = EgdRequest::decode(rest) {
        let mut encoded = Vec::new();
        request.encode(&mut encoded);
        assert_eq!(encoded[..], rest[..used]);
        rest = &rest[used..];
    }
});
