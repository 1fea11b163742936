//! Peer group scenarios over real loopback sockets.
//!
//! Every test runs against both the blocking and the event-loop transport.

mod common;

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use btc_peergroup::{
    PeerError, PeerGroupConfig, PeerGroupEvent, PeerState, Service, WireMessage,
};
use btc_peergroup::message::encode;
use common::*;

fn inv(tag: u8) -> WireMessage {
    WireMessage::Unknown {
        command: "inv".to_owned(),
        payload: vec![1, tag],
    }
}

#[test]
fn handshake_loads_filter_then_publishes_ready() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let mut events = group.subscribe();

        let (_remote, peer) = connect_peer(&group, &node, 1, remote_version_message(70002));

        assert_eq!(peer.state(), PeerState::Ready, "{kind:?}");
        assert_eq!(peer.negotiated_version(), Some(70002));
        assert_eq!(
            peer.remote_version().map(|v| v.user_agent),
            Some("/remote:0.1/".to_owned())
        );
        assert_eq!(group.ready_peers().len(), 1);
        assert!(group.pending_peers().is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(PeerGroupEvent::PeerReady { id, .. }) if id == peer.id()
        ));
    }
}

#[test]
fn pre_bloom_remote_gets_no_filter() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);

        let (remote, peer) = connect_peer(&group, &node, 1, remote_version_message(60002));

        assert_eq!(peer.state(), PeerState::Ready, "{kind:?}");
        assert_eq!(
            remote.next_message_timeout(Duration::from_millis(300)),
            Ok(None)
        );
    }
}

#[test]
fn bloom_capable_version_without_service_bit_gets_no_filter() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);

        // 70011 and later must advertise NODE_BLOOM.
        let (remote, _peer) = connect_peer(&group, &node, 1, remote_version_message(70011));
        assert_eq!(
            remote.next_message_timeout(Duration::from_millis(300)),
            Ok(None),
            "{kind:?}"
        );

        let with_bloom = remote_version_message(70011)
            .with_services(Service::NODE_NETWORK | Service::NODE_BLOOM);
        connect_peer(&group, &node, 2, with_bloom);
    }
}

#[test]
fn remote_without_block_chain_is_rejected() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let (remote, pending) = connect_peer_without_version_exchange(&group, &node, 1);

        let version = remote_version_message(70000).with_services(Service::UNNAMED);
        remote.send_message(&WireMessage::Version(version));
        remote.send_message(&WireMessage::VerAck);

        assert!(matches!(remote.next_message_blocking(), WireMessage::Version(_)));
        assert!(matches!(
            pending.wait(),
            Err(PeerError::HandshakeRejected(_))
        ), "{kind:?}");
        // No verack, no filter: the connection just ends.
        assert_eq!(remote.next_message_timeout(WAIT), Err(PeerError::ConnectionClosed));
        assert_eq!(group.peer_count(), 0);
    }
}

#[test]
fn echoed_nonce_is_a_self_connection() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let (remote, pending) = connect_peer_without_version_exchange(&group, &node, 1);

        let WireMessage::Version(ours) = remote.next_message_blocking() else {
            panic!("expected version first");
        };
        remote.send_message(&WireMessage::Version(ours));

        assert!(matches!(
            pending.wait(),
            Err(PeerError::HandshakeRejected(_))
        ), "{kind:?}");
    }
}

#[test]
fn duplicate_connect_is_rejected() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);

        let first = group.connect_to(node.addr()).unwrap();
        let _remote = node.accept();
        assert_eq!(
            group.connect_to(node.addr()).unwrap_err(),
            PeerError::AlreadyConnected { addr: node.addr() },
            "{kind:?}"
        );
        assert!(!first.peer().state().is_terminal());
        assert_eq!(group.peer_count(), 1);
    }
}

#[test]
fn no_pings_when_interval_is_zero() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);

        let (remote1, _p1) = connect_peer(&group, &node, 1, remote_version_message(70000));
        let (remote2, _p2) = connect_peer(&group, &node, 2, remote_version_message(70000));
        assert_eq!(group.ready_peers().len(), 2);

        for remote in [&remote1, &remote2] {
            assert_eq!(
                remote.next_message_timeout(Duration::from_secs(1)),
                Ok(None),
                "{kind:?}"
            );
        }
    }
}

#[test]
fn keep_alive_ping_measures_round_trip() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let (remote, peer) = connect_peer(&group, &node, 1, remote_version_message(70000));

        group.set_ping_interval(Duration::from_millis(200));
        let WireMessage::Ping(nonce) = remote.next_message_blocking() else {
            panic!("expected a ping");
        };
        remote.send_message(&WireMessage::Pong(nonce));

        let deadline = Instant::now() + WAIT;
        while peer.last_ping_time().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(peer.last_ping_time().is_some(), "{kind:?}");
    }
}

#[test]
fn remote_ping_is_answered() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let (remote, peer) = connect_peer(&group, &node, 1, remote_version_message(70000));

        remote.send_message(&WireMessage::Ping(0xfeed));
        assert_eq!(remote.next_message_blocking(), WireMessage::Pong(0xfeed), "{kind:?}");
        assert_eq!(peer.next_message_timeout(Duration::from_millis(100)), Ok(None));
    }
}

#[test]
fn malformed_frame_fails_only_that_peer() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let mut events = group.subscribe();

        let (remote1, peer1) = connect_peer(&group, &node, 1, remote_version_message(70000));
        let (remote2, peer2) = connect_peer(&group, &node, 2, remote_version_message(70000));

        let mut corrupt = btc_peergroup::message::encode(magic(), &inv(1)).unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        remote1.send_raw(&corrupt);

        assert!(matches!(
            wait_for_removal(&mut events, peer1.id()),
            Some(Some(PeerError::MalformedMessage(_)))
        ), "{kind:?}");
        assert_eq!(peer1.state(), PeerState::Failed);
        assert!(remote1.wait_closed());

        assert_eq!(peer2.state(), PeerState::Ready);
        peer2.send(&inv(2)).unwrap();
        assert_eq!(remote2.next_message_blocking(), inv(2));
        remote2.send_message(&inv(3));
        assert_eq!(peer2.next_message_timeout(WAIT), Ok(Some(inv(3))));
        assert_eq!(group.ready_peers().len(), 1);
    }
}

#[test]
fn close_before_version_unblocks_waiters() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let (remote, pending) = connect_peer_without_version_exchange(&group, &node, 1);

        let waiter = {
            let pending = pending.clone();
            thread::spawn(move || pending.wait())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(group.disconnect(SocketAddr::from(([127, 0, 0, 1], 2001))));

        assert_eq!(waiter.join().unwrap().unwrap_err(), PeerError::ConnectionClosed, "{kind:?}");
        assert_eq!(pending.peer().state(), PeerState::Closed);
        assert!(remote.wait_closed());
        assert_eq!(group.peer_count(), 0);
    }
}

#[test]
fn close_mid_handshake_unblocks_waiters() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let (remote, pending) = connect_peer_without_version_exchange(&group, &node, 1);

        remote.send_message(&WireMessage::Version(remote_version_message(70000)));
        assert!(matches!(remote.next_message_blocking(), WireMessage::Version(_)));
        assert!(matches!(remote.next_message_blocking(), WireMessage::VerAck));
        assert_eq!(pending.peer().state(), PeerState::VersionReceived);

        pending.peer().close();
        assert_eq!(pending.wait().unwrap_err(), PeerError::ConnectionClosed, "{kind:?}");
        assert!(remote.wait_closed());
    }
}

#[test]
fn remote_hangup_ends_message_stream() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let mut events = group.subscribe();
        let (remote, peer) = connect_peer(&group, &node, 1, remote_version_message(70000));

        remote.send_message(&inv(7));
        let reader = {
            let peer = peer.clone();
            thread::spawn(move || peer.messages().collect::<Vec<_>>())
        };
        thread::sleep(Duration::from_millis(50));
        remote.close();

        assert_eq!(reader.join().unwrap(), vec![inv(7)], "{kind:?}");
        assert_eq!(peer.state(), PeerState::Closed);
        assert_eq!(peer.failure(), Some(PeerError::Disconnected));
        assert_eq!(
            wait_for_removal(&mut events, peer.id()),
            Some(Some(PeerError::Disconnected))
        );
        assert_eq!(group.peer_count(), 0);
    }
}

#[test]
fn silent_remote_times_out() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group_with(
            kind,
            PeerGroupConfig::default().with_handshake_timeout(Duration::from_millis(300)),
        );
        let (remote, pending) = connect_peer_without_version_exchange(&group, &node, 1);

        assert_eq!(pending.wait().unwrap_err(), PeerError::Timeout, "{kind:?}");
        assert!(remote.wait_closed());
    }
}

#[test]
fn refused_connection_fails_the_peer() {
    for kind in TRANSPORTS {
        let group = peer_group(kind);
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let result = match group.connect_to(addr) {
            Ok(pending) => pending.wait().map(|_| ()),
            Err(e) => Err(e),
        };
        assert!(result.is_err(), "{kind:?}");
        assert_eq!(group.peer_count(), 0);
    }
}

#[test]
fn broadcast_reaches_every_ready_peer() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);

        let (remote1, _p1) = connect_peer(&group, &node, 1, remote_version_message(70000));
        let (remote2, _p2) = connect_peer(&group, &node, 2, remote_version_message(60002));
        let (_remote3, _pending) = connect_peer_without_version_exchange(&group, &node, 3);

        assert_eq!(group.broadcast(&inv(9)), 2, "{kind:?}");
        assert_eq!(remote1.next_message_blocking(), inv(9));
        assert_eq!(remote2.next_message_blocking(), inv(9));
        assert_eq!(group.pending_peers().len(), 1);
    }
}

#[test]
fn shutdown_closes_every_peer() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);

        let (remote1, peer1) = connect_peer(&group, &node, 1, remote_version_message(70000));
        let (remote2, pending) = connect_peer_without_version_exchange(&group, &node, 2);

        group.shutdown();
        group.shutdown();

        assert!(peer1.state().is_terminal(), "{kind:?}");
        assert_eq!(pending.wait().unwrap_err(), PeerError::ConnectionClosed);
        assert!(remote1.wait_closed());
        assert!(remote2.wait_closed());
        assert_eq!(group.peer_count(), 0);
    }
}

#[test]
fn truncated_frames_fail_only_their_own_peer() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let mut events = group.subscribe();
        let (cut_header, first) = connect_peer(&group, &node, 1, remote_version_message(70000));
        let (cut_payload, second) = connect_peer(&group, &node, 2, remote_version_message(70000));
        let (sibling, third) = connect_peer(&group, &node, 3, remote_version_message(70000));

        let frame = encode(
            magic(),
            &WireMessage::Unknown {
                command: "inv".to_owned(),
                payload: vec![7; 1000],
            },
        )
        .unwrap();
        // Half a header, then a header promising more payload than arrives.
        cut_header.send_raw(&frame[..10]);
        cut_payload.send_raw(&frame[..34]);
        thread::sleep(Duration::from_millis(50));
        cut_header.close();
        cut_payload.close();

        for peer in [&first, &second] {
            let reason = wait_for_removal(&mut events, peer.id());
            assert!(
                matches!(
                    reason,
                    Some(Some(PeerError::MalformedMessage(_) | PeerError::Disconnected))
                ),
                "{kind:?}: {reason:?}"
            );
            assert_eq!(peer.state(), PeerState::Failed);
        }

        assert_eq!(third.state(), PeerState::Ready, "{kind:?}");
        sibling.send_message(&inv(3));
        assert_eq!(third.messages().next(), Some(inv(3)));
        third.send(&inv(4)).unwrap();
        assert_eq!(sibling.next_message_blocking(), inv(4));
        assert_eq!(group.ready_peers().len(), 1);
    }
}

#[test]
fn close_is_not_held_up_by_a_remote_that_stopped_reading() {
    for kind in TRANSPORTS {
        let node = RemoteNode::start();
        let group = peer_group(kind);
        let mut events = group.subscribe();
        let (stalled, peer) = connect_peer(&group, &node, 1, remote_version_message(70000));
        let (sibling, other) = connect_peer(&group, &node, 2, remote_version_message(70000));
        stalled.stop_reading();

        let sender = {
            let peer = peer.clone();
            thread::spawn(move || {
                peer.send(&WireMessage::Unknown {
                    command: "inv".to_owned(),
                    payload: vec![0; 30 * 1024 * 1024],
                })
            })
        };
        thread::sleep(Duration::from_millis(200));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        {
            let peer = peer.clone();
            thread::spawn(move || {
                peer.close();
                let _ = done_tx.send(peer.state());
            });
        }
        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(2)),
            Ok(PeerState::Closed),
            "{kind:?}"
        );
        assert_eq!(
            wait_for_removal(&mut events, peer.id()),
            Some(None),
            "{kind:?}"
        );
        let _ = sender.join().unwrap();

        other.send(&inv(9)).unwrap();
        assert_eq!(sibling.next_message_blocking(), inv(9));
        let (_third, _) = connect_peer(&group, &node, 3, remote_version_message(70000));
        assert_eq!(group.ready_peers().len(), 2);
        stalled.close();
    }
}
