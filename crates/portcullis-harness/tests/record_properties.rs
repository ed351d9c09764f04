//! Property-based tests for the record session lifecycle.
//!
//! Random interleavings of local and peer operations are run against a small
//! model of the session. After every step:
//! - the session state matches the model
//! - sends after shutdown or a fatal error report `SessionClosed`
//!
//! At teardown:
//! - the peer received exactly the bytes the session accepted
//! - at most one close_notify was sent
//! - the transport was closed exactly once

use std::collections::VecDeque;

use bytes::Bytes;
use portcullis_core::{
    PeerCertPolicy, ReceiveOutcome, RecordError, SessionState, ShutdownMode,
};
use portcullis_harness::{fixture::Fixture, loopback_pair};
use portcullis_proto::{Alert, AlertDescription, record::MAX_FRAGMENT_LEN};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send(Vec<u8>),
    Receive,
    ShutdownWrite,
    Shutdown(ShutdownMode),
    PeerSend(Vec<u8>),
    PeerHeartbeat,
    PeerWarning,
    PeerCorrupt,
    PeerCloseNotify,
}

/// What the next `receive` should report.
#[derive(Debug)]
enum Expected {
    Data(Vec<u8>),
    Recoverable,
    Fatal,
    PeerClosed,
}

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => payload().prop_map(Op::Send),
        4 => Just(Op::Receive),
        1 => Just(Op::ShutdownWrite),
        1 => prop_oneof![Just(ShutdownMode::Graceful), Just(ShutdownMode::Abrupt)].prop_map(Op::Shutdown),
        4 => payload().prop_map(Op::PeerSend),
        1 => Just(Op::PeerHeartbeat),
        1 => Just(Op::PeerWarning),
        1 => Just(Op::PeerCorrupt),
        1 => Just(Op::PeerCloseNotify),
    ]
}

struct Model {
    state: SessionState,
    peer_closed_reported: bool,
    peer_close_sent: bool,
    close_notify_sent: bool,
    inbound: VecDeque<Expected>,
    delivered: Vec<u8>,
}

impl Model {
    fn new() -> Self {
        Self {
            state: SessionState::Open,
            peer_closed_reported: false,
            peer_close_sent: false,
            close_notify_sent: false,
            inbound: VecDeque::new(),
            delivered: Vec::new(),
        }
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        self.inbound.clear();
    }

    /// Peer operations only make sense while the transport is open and the
    /// peer has not closed its own direction.
    fn peer_can_send(&self) -> bool {
        self.state != SessionState::Closed && !self.peer_close_sent
    }
}

#[test]
fn prop_session_matches_model() {
    proptest!(ProptestConfig::with_cases(48), |(ops in prop::collection::vec(op_strategy(), 1..24))| {
        let fixture = Fixture::new(0xfeed);
        let (client, mut server) = loopback_pair();
        let (mut session, mut peer) = fixture.establish(&mut server, client, PeerCertPolicy::None);
        let mut model = Model::new();

        for op in ops {
            match op {
                Op::Send(data) => {
                    let result = session.send(&data);
                    if model.state != SessionState::Open {
                        assert_eq!(result, Err(RecordError::SessionClosed));
                    } else {
                        let accepted = data.len().min(MAX_FRAGMENT_LEN);
                        assert_eq!(result, Ok(accepted));
                        model.delivered.extend_from_slice(&data[..accepted]);
                    }
                },
                Op::Receive => {
                    if model.state == SessionState::Closed || model.peer_closed_reported {
                        assert_eq!(session.receive(usize::MAX), Err(RecordError::SessionClosed));
                        continue;
                    }
                    // Nothing queued: receive would block.
                    let Some(expected) = model.inbound.pop_front() else { continue };
                    let result = session.receive(64 * 1024);
                    match expected {
                        Expected::Data(data) => {
                            assert_eq!(result, Ok(ReceiveOutcome::Data(Bytes::from(data))));
                        },
                        Expected::Recoverable => {
                            assert!(matches!(result, Err(RecordError::Recoverable(_))));
                        },
                        Expected::Fatal => {
                            assert!(matches!(result, Err(RecordError::Fatal(_))));
                            model.close();
                        },
                        Expected::PeerClosed => {
                            assert_eq!(result, Ok(ReceiveOutcome::PeerClosed));
                            model.peer_closed_reported = true;
                            if model.state == SessionState::ShutdownSent {
                                model.close();
                            }
                        },
                    }
                },
                Op::ShutdownWrite => {
                    let result = session.shutdown_write();
                    match model.state {
                        SessionState::Closed => assert_eq!(result, Err(RecordError::SessionClosed)),
                        SessionState::ShutdownSent => assert_eq!(result, Ok(())),
                        SessionState::Open => {
                            assert_eq!(result, Ok(()));
                            model.close_notify_sent = true;
                            model.state = SessionState::ShutdownSent;
                            if model.peer_closed_reported {
                                model.close();
                            }
                        },
                    }
                },
                Op::Shutdown(mode) => {
                    session.shutdown(mode);
                    if model.state != SessionState::Closed && mode == ShutdownMode::Graceful {
                        model.close_notify_sent = true;
                    }
                    model.close();
                },
                Op::PeerSend(data) => {
                    if model.peer_can_send() && !data.is_empty() {
                        peer.send(&data).unwrap();
                        model.inbound.push_back(Expected::Data(data));
                    }
                },
                Op::PeerHeartbeat => {
                    if model.peer_can_send() {
                        peer.send_heartbeat().unwrap();
                        model.inbound.push_back(Expected::Recoverable);
                    }
                },
                Op::PeerWarning => {
                    if model.peer_can_send() {
                        peer.send_alert(Alert::warning(AlertDescription::UserCanceled)).unwrap();
                        model.inbound.push_back(Expected::Recoverable);
                    }
                },
                Op::PeerCorrupt => {
                    if model.peer_can_send() {
                        peer.send_corrupted(b"flipped").unwrap();
                        model.inbound.push_back(Expected::Fatal);
                    }
                },
                Op::PeerCloseNotify => {
                    if model.peer_can_send() {
                        peer.send_close_notify().unwrap();
                        model.peer_close_sent = true;
                        model.inbound.push_back(Expected::PeerClosed);
                    }
                },
            }
            assert_eq!(session.state(), model.state);
        }

        session.shutdown(ShutdownMode::Graceful);
        if model.state != SessionState::Closed {
            model.close_notify_sent = true;
        }
        drop(session);

        let (data, alerts) = peer.drain().unwrap();
        let close_notifies = alerts.iter().filter(|alert| alert.is_close_notify()).count();
        assert_eq!(data, model.delivered);
        assert_eq!(close_notifies, usize::from(model.close_notify_sent));
        assert_eq!(peer.stream().peer_close_calls(), 1);
    });
}
