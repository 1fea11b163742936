//! Shared helpers for peer group integration tests.
//!
//! A [`RemoteNode`] listens on loopback and plays the far side of every
//! connection the group opens. Frames it reads land in an
//! [`InboundMessageQueue`] so tests can assert on them in order.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::TryRecvError};

use btc_peergroup::{
    message::encode, FrameDecoder, InboundMessageQueue, Peer, PeerError, PeerGroup,
    PeerGroupConfig, PeerGroupEvent, PeerId, PeerResult, PendingConnection, ProtocolConfig,
    Service, TransportKind, VersionMessage, WireMessage, BLOOM_FILTER_MIN_VERSION,
};

/// Long enough for a loopback round trip on a loaded CI box.
pub const WAIT: Duration = Duration::from_secs(5);

/// Both transports; every scenario runs once per entry.
pub const TRANSPORTS: [TransportKind; 2] = [TransportKind::Blocking, TransportKind::NonBlocking];

pub fn magic() -> [u8; 4] {
    ProtocolConfig::unit_test().magic
}

/// A group on unit test params with pings disabled, as most tests want.
pub fn peer_group(kind: TransportKind) -> PeerGroup {
    peer_group_with(kind, PeerGroupConfig::default())
}

pub fn peer_group_with(kind: TransportKind, config: PeerGroupConfig) -> PeerGroup {
    PeerGroup::with_transport_kind(
        ProtocolConfig::unit_test(),
        Arc::new(0_i32),
        kind,
        config.with_ping_interval(Duration::ZERO),
    )
    .expect("peer group")
}

/// The version a well behaved remote full node answers with.
pub fn remote_version_message(version: i32) -> VersionMessage {
    let addr = SocketAddr::from(([127, 0, 0, 1], 18444));
    VersionMessage::new_with_defaults(addr, addr)
        .with_version(version)
        .with_services(Service::NODE_NETWORK)
        .with_user_agent("/remote:0.1/")
}

/// Listens on an ephemeral loopback port and hands out accepted connections.
pub struct RemoteNode {
    addr: SocketAddr,
    accepted: Arc<InboundMessageQueue<RemotePeer>>,
}

impl RemoteNode {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accepted = Arc::new(InboundMessageQueue::new(64));
        let queue = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                if queue.push(RemotePeer::spawn(stream)).is_err() {
                    break;
                }
            }
        });
        Self { addr, accepted }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The next connection the group opened to us.
    pub fn accept(&self) -> RemotePeer {
        self.accepted
            .pop_timeout(WAIT)
            .expect("listener closed")
            .expect("no connection accepted")
    }
}

impl Drop for RemoteNode {
    fn drop(&mut self) {
        self.accepted.close();
    }
}

/// Our end of one accepted connection.
pub struct RemotePeer {
    stream: TcpStream,
    inbound: Arc<InboundMessageQueue<WireMessage>>,
    paused: Arc<AtomicBool>,
}

impl RemotePeer {
    fn spawn(stream: TcpStream) -> Self {
        let inbound = Arc::new(InboundMessageQueue::new(1024));
        let mut reader = stream.try_clone().expect("clone stream");
        let queue = inbound.clone();
        let paused = Arc::new(AtomicBool::new(false));
        let reader_paused = paused.clone();
        thread::spawn(move || {
            let mut decoder = FrameDecoder::new(magic());
            let mut buf = [0u8; 4096];
            'read: loop {
                if reader_paused.load(Ordering::Acquire) {
                    if queue.is_closed() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                let n = match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => {
                            if queue.push(message).is_err() {
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break 'read,
                    }
                }
            }
            queue.close();
        });
        Self {
            stream,
            inbound,
            paused,
        }
    }

    /// Leaves everything the group sends in the socket buffers from now on.
    pub fn stop_reading(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn send_message(&self, message: &WireMessage) {
        let bytes = encode(magic(), message).expect("encode");
        self.send_raw(&bytes);
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        (&self.stream).write_all(bytes).expect("write to peer");
    }

    /// Blocks for the next frame the group sent us.
    pub fn next_message_blocking(&self) -> WireMessage {
        self.inbound
            .pop_timeout(WAIT)
            .expect("connection closed")
            .expect("timed out waiting for a message")
    }

    pub fn next_message_timeout(&self, timeout: Duration) -> PeerResult<Option<WireMessage>> {
        self.inbound.pop_timeout(timeout)
    }

    /// Waits for the group side to drop the connection, discarding frames.
    pub fn wait_closed(&self) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Err(PeerError::ConnectionClosed) = self.inbound.pop_timeout(WAIT) {
                return true;
            }
        }
        false
    }

    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.inbound.close();
    }
}

/// Opens a connection and claims the peer lives at 127.0.0.1:(2000 + id), so
/// several loopback peers have distinct addresses.
pub fn connect_peer_without_version_exchange(
    group: &PeerGroup,
    node: &RemoteNode,
    id: u16,
) -> (RemotePeer, PendingConnection) {
    let pending = group.connect_to(node.addr()).expect("connect");
    let remote = node.accept();
    pending
        .peer()
        .set_remote_addr(SocketAddr::from(([127, 0, 0, 1], 2000 + id)));
    (remote, pending)
}

/// Drives the full handshake from the remote side and returns the ready peer.
pub fn connect_peer(
    group: &PeerGroup,
    node: &RemoteNode,
    id: u16,
    version: VersionMessage,
) -> (RemotePeer, Arc<Peer>) {
    assert!(version.has_block_chain());
    let bloom = version.is_bloom_filtering_supported(BLOOM_FILTER_MIN_VERSION);
    let (remote, pending) = connect_peer_without_version_exchange(group, node, id);

    remote.send_message(&WireMessage::Version(version));
    remote.send_message(&WireMessage::VerAck);
    assert!(matches!(remote.next_message_blocking(), WireMessage::Version(_)));
    assert!(matches!(remote.next_message_blocking(), WireMessage::VerAck));
    if bloom {
        assert!(matches!(remote.next_message_blocking(), WireMessage::FilterLoad(_)));
        assert!(matches!(remote.next_message_blocking(), WireMessage::MemPool));
    }

    let peer = pending
        .wait_timeout(WAIT)
        .expect("handshake did not finish")
        .expect("handshake failed");
    (remote, peer)
}

/// Polls `events` until `id` is removed; returns the removal reason.
pub fn wait_for_removal(
    events: &mut broadcast::Receiver<PeerGroupEvent>,
    id: PeerId,
) -> Option<Option<PeerError>> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(PeerGroupEvent::PeerRemoved { id: removed, reason, .. }) if removed == id => {
                return Some(reason)
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(10)),
            Err(TryRecvError::Closed) => return None,
        }
    }
    None
}
