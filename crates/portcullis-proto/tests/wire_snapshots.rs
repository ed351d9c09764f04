//! Snapshot tests for wire format stability.
//!
//! Inline hex snapshots of every structure this crate encodes. If one of
//! these changes, providers and daemons built against the old layout break.

use insta::assert_snapshot;
use portcullis_proto::{
    Alert, AlertDescription, ContentType, Record,
    egd::{EgdCommand, EgdRequest},
};

fn record_to_hex(record: &Record) -> String {
    let mut buf = Vec::new();
    record.encode(&mut buf).expect("encoding should succeed");
    hex::encode(&buf)
}

fn egd_to_hex(request: EgdRequest) -> String {
    let mut buf = Vec::new();
    request.encode(&mut buf);
    hex::encode(&buf)
}

#[test]
fn snapshot_handshake_record() {
    let record = Record::new(ContentType::Handshake, &b"hi"[..]);
    assert_snapshot!(record_to_hex(&record), @"16030300026869");
}

#[test]
fn snapshot_empty_application_record() {
    let record = Record::new(ContentType::ApplicationData, Vec::new());
    assert_snapshot!(record_to_hex(&record), @"1703030000");
}

#[test]
fn snapshot_close_notify_record() {
    let record = Record::new(ContentType::Alert, Alert::close_notify().to_bytes().to_vec());
    assert_snapshot!(record_to_hex(&record), @"15030300020100");
}

#[test]
fn snapshot_fatal_alert_record() {
    let alert = Alert::fatal(AlertDescription::BadRecordMac);
    let record = Record::new(ContentType::Alert, alert.to_bytes().to_vec());
    assert_snapshot!(record_to_hex(&record), @"15030300020214");
}

#[test]
fn snapshot_egd_requests() {
    assert_snapshot!(egd_to_hex(EgdRequest::EntropyLevel), @"00");
    assert_snapshot!(egd_to_hex(EgdRequest::Read { len: 32 }), @"0120");
    assert_snapshot!(egd_to_hex(EgdRequest::ReadBlocking { len: 255 }), @"02ff");
}

#[test]
fn egd_command_bytes_are_stable() {
    assert_eq!(EgdCommand::EntropyLevel.to_u8(), 0x00);
    assert_eq!(EgdCommand::ReadNonBlocking.to_u8(), 0x01);
    assert_eq!(EgdCommand::ReadBlocking.to_u8(), 0x02);
    assert_eq!(EgdCommand::WriteEntropy.to_u8(), 0x03);
    assert_eq!(EgdCommand::ProcessId.to_u8(), 0x04);
}
