//! Property-based tests for the decoders.
//!
//! Decoders face bytes straight off the network, so they must never panic and
//! must never claim to have consumed more than they were given.

use portcullis_proto::{
    Alert, ContentType, Record,
    egd::EgdRequest,
    record::{MAX_FRAGMENT_LEN, RECORD_HEADER_LEN},
};
use proptest::prelude::*;

fn content_type_strategy() -> impl Strategy<Value = ContentType> {
    prop_oneof![
        Just(ContentType::ChangeCipherSpec),
        Just(ContentType::Alert),
        Just(ContentType::Handshake),
        Just(ContentType::ApplicationData),
    ]
}

#[test]
fn prop_record_decode_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..64))| {
        if let Ok(Some((record, consumed))) = Record::decode(&bytes) {
            prop_assert!(consumed <= bytes.len());
            prop_assert_eq!(consumed, RECORD_HEADER_LEN + record.fragment.len());
        }
    });
}

#[test]
fn prop_record_survives_arbitrary_split() {
    proptest!(|(
        content_type in content_type_strategy(),
        fragment in prop::collection::vec(any::<u8>(), 0..256),
        split in 0usize..300,
    )| {
        let record = Record::new(content_type, fragment);
        let mut buf = Vec::new();
        record.encode(&mut buf).unwrap();

        let split = split.min(buf.len());
        if split < buf.len() {
            prop_assert_eq!(Record::decode(&buf[..split]).unwrap(), None);
        }

        let (decoded, consumed) = Record::decode(&buf).unwrap().unwrap();
        prop_assert_eq!(consumed, buf.len());
        prop_assert_eq!(decoded, record);
    });
}

#[test]
fn prop_alert_decode_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..4))| {
        let _ = Alert::from_bytes(&bytes);
    });
}

#[test]
fn prop_egd_decode_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..4))| {
        if let Ok(Some((_, consumed))) = EgdRequest::decode(&bytes) {
            prop_assert!(consumed <= bytes.len());
        }
    });
}

#[test]
fn max_fragment_fits_header_length() {
    assert!(MAX_FRAGMENT_LEN <= usize::from(u16::MAX));
}
