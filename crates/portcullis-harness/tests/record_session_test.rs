//! Record session behavior over an established toy channel.
//!
//! Covers:
//! - data in both directions, including multi-record payloads
//! - recoverable anomalies versus fatal ones
//! - half-close in both directions
//! - exactly one close_notify and exactly one transport close
//! - cancellation through a close handle from another thread, over loopback
//!   and over TCP
//! - graceful shutdown giving up on a peer that stopped reading

use std::{
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use portcullis_core::{
    PeerCertPolicy, ReceiveOutcome, RecordError, SessionState, ShutdownMode,
    config::{HandshakeConfig, RecordConfig},
    handshake::HandshakeEngine,
    transport::{ByteStream, ByteStreamListener, CloseHandle, TcpConnection},
};
use portcullis_harness::{PeerEvent, SimPeer, fixture::Fixture, loopback_pair};
use portcullis_proto::{Alert, AlertDescription};

fn receive_exact<S, Ch>(
    session: &mut portcullis_core::RecordSession<'_, S, Ch>,
    len: usize,
) -> Vec<u8>
where
    S: ByteStream,
    Ch: portcullis_core::crypto::SecureChannel,
{
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        match session.receive(len - data.len()).unwrap() {
            ReceiveOutcome::Data(chunk) => data.extend_from_slice(&chunk),
            ReceiveOutcome::PeerClosed => panic!("peer closed after {} bytes", data.len()),
        }
    }
    data
}

fn data(bytes: &'static [u8]) -> ReceiveOutcome {
    ReceiveOutcome::Data(Bytes::from_static(bytes))
}

fn close_notifies(alerts: &[Alert]) -> usize {
    alerts.iter().filter(|alert| alert.is_close_notify()).count()
}

#[test]
fn data_flows_both_ways() {
    let fixture = Fixture::new(1);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.send(b"ping").unwrap();
    assert_eq!(session.receive(1024).unwrap(), data(b"ping"));

    session.send_all(b"pong").unwrap();
    assert_eq!(peer.recv().unwrap(), PeerEvent::Data(b"pong".to_vec()));
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn large_payloads_span_records() {
    let fixture = Fixture::new(2);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    peer.send(&payload).unwrap();
    assert_eq!(receive_exact(&mut session, payload.len()), payload);

    session.send_all(&payload).unwrap();
    assert_eq!(peer.recv_exact(payload.len()).unwrap(), payload);
}

#[test]
fn single_send_is_capped_at_one_fragment() {
    let fixture = Fixture::new(3);
    let (client, mut server) = loopback_pair();
    let (mut session, _peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    let payload = vec![7u8; 40_000];
    assert_eq!(session.send(&payload).unwrap(), portcullis_proto::record::MAX_FRAGMENT_LEN);
}

#[test]
fn receive_respects_capacity() {
    let fixture = Fixture::new(4);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.send(b"abcdefgh").unwrap();
    assert_eq!(session.receive(3).unwrap(), data(b"abc"));
    assert_eq!(session.receive(3).unwrap(), data(b"def"));
    assert_eq!(session.receive(3).unwrap(), data(b"gh"));
}

#[test]
fn empty_send_writes_nothing() {
    let fixture = Fixture::new(5);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    assert_eq!(session.send(b""), Ok(0));
    session.shutdown(ShutdownMode::Graceful);
    drop(session);

    let (data, alerts) = peer.drain().unwrap();
    assert!(data.is_empty());
    assert_eq!(alerts, vec![Alert::close_notify()]);
}

#[test]
fn heartbeat_and_warning_alert_are_recoverable() {
    let fixture = Fixture::new(6);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.send_heartbeat().unwrap();
    peer.send_alert(Alert::warning(AlertDescription::UserCanceled)).unwrap();
    peer.send(b"still here").unwrap();

    assert!(matches!(session.receive(64), Err(RecordError::Recoverable(_))));
    assert!(matches!(session.receive(64), Err(RecordError::Recoverable(_))));
    assert_eq!(session.receive(64).unwrap(), data(b"still here"));
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn corrupted_record_is_fatal_and_reported_to_peer() {
    let fixture = Fixture::new(7);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.send_corrupted(b"tampered").unwrap();
    peer.send(b"never delivered").unwrap();

    let err = session.receive(64).unwrap_err();
    assert!(matches!(err, RecordError::Fatal(_)));
    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.receive(64), Err(RecordError::SessionClosed));
    assert_eq!(session.send(b"late"), Err(RecordError::SessionClosed));
    drop(session);

    let (data, alerts) = peer.drain().unwrap();
    assert!(data.is_empty());
    assert_eq!(alerts, vec![Alert::fatal(AlertDescription::BadRecordMac)]);
    assert_eq!(peer.stream().peer_close_calls(), 1);
}

#[test]
fn fatal_alert_from_peer_ends_session_after_earlier_data() {
    let fixture = Fixture::new(8);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.send(b"0123456789").unwrap();
    peer.send_alert(Alert::fatal(AlertDescription::InternalError)).unwrap();

    assert_eq!(session.receive(4).unwrap(), data(b"0123"));
    // Plaintext already opened is handed out before the alert is read.
    assert_eq!(session.receive(64).unwrap(), data(b"456789"));
    assert!(matches!(session.receive(64), Err(RecordError::Fatal(_))));
    assert_eq!(session.receive(64), Err(RecordError::SessionClosed));
}

#[test]
fn eof_without_close_notify_is_fatal() {
    let fixture = Fixture::new(9);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.close();
    assert!(matches!(session.receive(64), Err(RecordError::Fatal(_))));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn peer_half_close_leaves_send_direction_open() {
    let fixture = Fixture::new(10);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.send(b"last words").unwrap();
    peer.send_close_notify().unwrap();

    assert_eq!(session.receive(64).unwrap(), data(b"last words"));
    assert_eq!(session.receive(64).unwrap(), ReceiveOutcome::PeerClosed);
    assert!(session.peer_closed());
    assert_eq!(session.receive(64), Err(RecordError::SessionClosed));

    session.send_all(b"goodbye").unwrap();
    session.shutdown(ShutdownMode::Graceful);
    drop(session);

    let (data, alerts) = peer.drain().unwrap();
    assert_eq!(data, b"goodbye");
    assert_eq!(close_notifies(&alerts), 1);
}

#[test]
fn local_half_close_still_receives() {
    let fixture = Fixture::new(11);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    session.shutdown_write().unwrap();
    assert_eq!(session.state(), SessionState::ShutdownSent);
    assert_eq!(session.send(b"too late"), Err(RecordError::SessionClosed));
    assert_eq!(session.shutdown_write(), Ok(()));
    assert_eq!(peer.recv().unwrap(), PeerEvent::Alert(Alert::close_notify()));

    peer.send(b"reply").unwrap();
    peer.send_close_notify().unwrap();
    assert_eq!(session.receive(64).unwrap(), data(b"reply"));
    assert_eq!(session.receive(64).unwrap(), ReceiveOutcome::PeerClosed);
    assert_eq!(session.state(), SessionState::Closed);

    assert!(peer.stream().wait_peer_closed(Duration::from_secs(5)));
    assert_eq!(peer.recv().unwrap(), PeerEvent::Eof);
}

#[test]
fn repeated_shutdown_sends_one_close_notify_and_closes_once() {
    let fixture = Fixture::new(12);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    session.shutdown(ShutdownMode::Graceful);
    session.shutdown(ShutdownMode::Graceful);
    session.shutdown(ShutdownMode::Abrupt);
    assert_eq!(session.state(), SessionState::Closed);
    drop(session);

    let (_, alerts) = peer.drain().unwrap();
    assert_eq!(close_notifies(&alerts), 1);
    assert_eq!(peer.stream().peer_close_calls(), 1);
}

#[test]
fn abrupt_shutdown_sends_no_close_notify() {
    let fixture = Fixture::new(13);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    session.send_all(b"partial").unwrap();
    session.shutdown(ShutdownMode::Abrupt);
    drop(session);

    let (data, alerts) = peer.drain().unwrap();
    assert_eq!(data, b"partial");
    assert!(alerts.is_empty());
    assert_eq!(peer.stream().peer_close_calls(), 1);
}

#[test]
fn dropping_session_closes_transport() {
    let fixture = Fixture::new(14);
    let (client, mut server) = loopback_pair();
    let (session, peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    drop(session);
    assert!(peer.stream().is_peer_closed());
    assert_eq!(peer.stream().peer_close_calls(), 1);
}

#[test]
fn close_handle_cancels_blocked_receive() {
    let fixture = Fixture::new(15);
    let (client, mut server) = loopback_pair();
    let closer = server.close_handle().unwrap();
    let (mut session, _peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        closer.close();
    });

    let started = Instant::now();
    assert_eq!(session.receive(64), Err(RecordError::SessionClosed));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.send(b"x"), Err(RecordError::SessionClosed));
    canceller.join().unwrap();
}

#[test]
fn close_handle_cancels_blocked_receive_over_tcp() {
    let fixture = Fixture::new(17);
    let mut listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpConnection::from(TcpStream::connect(listener.local_addr().unwrap()).unwrap());
    let mut server = ByteStreamListener::accept(&mut listener).unwrap();
    let closer = server.close_handle().unwrap();

    let client = thread::spawn(move || {
        let mut peer = SimPeer::new(client, 17);
        peer.handshake().map(|_| peer)
    });
    let mut engine =
        HandshakeEngine::new(&mut server, &fixture.store, &*fixture.crypto, &HandshakeConfig::default());
    engine.complete().unwrap();
    let mut session = engine.into_session(&RecordConfig::default()).unwrap();
    // Keep the client connected so only the local close can end the read.
    let _peer = client.join().unwrap().unwrap();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        closer.close();
    });

    let started = Instant::now();
    assert_eq!(session.receive(64), Err(RecordError::SessionClosed));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.send(b"x"), Err(RecordError::SessionClosed));
    canceller.join().unwrap();
}

#[test]
fn graceful_shutdown_gives_up_on_stalled_peer() {
    let fixture = Fixture::new(18);
    let (client, mut server) = loopback_pair();
    let record = RecordConfig { shutdown_timeout: Duration::from_millis(100), ..RecordConfig::default() };
    let (mut session, mut peer) =
        fixture.establish_with(&mut server, client, PeerCertPolicy::None, &record);
    peer.stream().set_receive_window(Some(0));

    let started = Instant::now();
    session.shutdown(ShutdownMode::Graceful);
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(5));
    assert_eq!(session.state(), SessionState::Closed);
    drop(session);

    let (_, alerts) = peer.drain().unwrap();
    assert_eq!(close_notifies(&alerts), 0);
    assert_eq!(peer.stream().peer_close_calls(), 1);
}

#[test]
fn zero_capacity_receive_still_makes_progress() {
    let fixture = Fixture::new(19);
    let (client, mut server) = loopback_pair();
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    peer.send(b"abc").unwrap();
    assert_eq!(session.receive(0).unwrap(), data(b"a"));
    assert_eq!(session.receive(0).unwrap(), data(b"b"));
    assert_eq!(session.receive(8).unwrap(), data(b"c"));
}

#[test]
fn short_writes_are_completed() {
    let fixture = Fixture::new(16);
    let (client, mut server) = loopback_pair();
    server.set_max_write(Some(7));
    let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);

    let payload = vec![0xA5u8; 20_000];
    session.send_all(&payload).unwrap();
    assert_eq!(peer.recv_exact(payload.len()).unwrap(), payload);
}
