//! Pool of peers: outbound connects, readiness tracking and pool-wide policy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::broadcast;

use crate::bloom::BloomFilter;
use crate::config::{PeerGroupConfig, ProtocolConfig};
use crate::error::{PeerError, PeerResult};
use crate::handshake::PeerState;
use crate::message::{VersionMessage, WireMessage};
use crate::peer::{Peer, PeerId, PeerSignal};
use crate::transport::{Transport, TransportKind};

/// How often deadlines and keep-alive pings are checked.
const HOUSEKEEPING_TICK: Duration = Duration::from_millis(100);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The chain our version message advertises. The pool reads nothing else from it.
pub trait ChainHead: Send + Sync {
    fn best_height(&self) -> i32;
}

impl ChainHead for i32 {
    fn best_height(&self) -> i32 {
        *self
    }
}

/// Pool membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerGroupEvent {
    /// Handshake complete, the peer is in the ready set.
    PeerReady { id: PeerId, addr: SocketAddr },
    /// The peer left the pool; `reason` is `None` for a local close.
    PeerRemoved {
        id: PeerId,
        addr: SocketAddr,
        reason: Option<PeerError>,
    },
}

#[derive(Default)]
struct Registry {
    pending: HashMap<PeerId, Arc<Peer>>,
    ready: HashMap<PeerId, Arc<Peer>>,
}

impl Registry {
    fn peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.pending.values().chain(self.ready.values())
    }

    fn len(&self) -> usize {
        self.pending.len() + self.ready.len()
    }
}

struct Shared {
    params: Arc<ProtocolConfig>,
    config: RwLock<PeerGroupConfig>,
    chain: Arc<dyn ChainHead>,
    transport: Arc<dyn Transport>,
    registry: RwLock<Registry>,
    events: broadcast::Sender<PeerGroupEvent>,
    next_id: AtomicU64,
    stopping: AtomicBool,
    stop_lock: Mutex<()>,
    stop_signal: Condvar,
}

impl Shared {
    fn on_peer_signal(&self, id: PeerId, signal: PeerSignal) {
        match signal {
            PeerSignal::Ready => {
                let addr = {
                    let mut registry = self.registry.write();
                    // A peer that terminated meanwhile stays put for its Terminated signal.
                    if !registry
                        .pending
                        .get(&id)
                        .is_some_and(|peer| peer.state() == PeerState::Ready)
                    {
                        return;
                    }
                    let Some(peer) = registry.pending.remove(&id) else {
                        return;
                    };
                    let addr = peer.remote_addr();
                    registry.ready.insert(id, peer);
                    addr
                };
                let _ = self.events.send(PeerGroupEvent::PeerReady { id, addr });
            }
            PeerSignal::Terminated(reason) => {
                let removed = {
                    let mut registry = self.registry.write();
                    registry
                        .pending
                        .remove(&id)
                        .or_else(|| registry.ready.remove(&id))
                };
                if let Some(peer) = removed {
                    let addr = peer.remote_addr();
                    tracing::debug!(peer = %id, addr = %addr, "Removed from pool");
                    let _ = self.events.send(PeerGroupEvent::PeerRemoved { id, addr, reason });
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.registry.read().peers().cloned().collect()
    }

    fn housekeeping(self: &Arc<Self>) {
        let now = Instant::now();
        let ping_interval = self.config.read().ping_interval;
        let peers = self.snapshot();
        // Deadlines first: a ping may block on a peer that stopped reading.
        for peer in peers.iter().filter(|p| p.state().is_handshaking()) {
            peer.check_handshake_deadline(now);
        }
        if ping_interval.is_zero() {
            return;
        }
        for peer in peers.iter().filter(|p| p.state() == PeerState::Ready) {
            peer.maybe_ping(now, ping_interval);
        }
    }
}

/// Resolves to the peer once its handshake completes, or to the reason it failed.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    peer: Arc<Peer>,
}

impl PendingConnection {
    /// The peer, whatever its state.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Blocks until the peer is ready or terminated.
    pub fn wait(&self) -> PeerResult<Arc<Peer>> {
        match self.peer.wait_for_handshake(None) {
            Some(Ok(())) => Ok(self.peer.clone()),
            Some(Err(e)) => Err(e),
            None => Err(PeerError::ConnectionClosed),
        }
    }

    /// Like [`wait`](Self::wait), `None` if nothing was decided within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<PeerResult<Arc<Peer>>> {
        self.peer
            .wait_for_handshake(Some(timeout))
            .map(|outcome| outcome.map(|()| self.peer.clone()))
    }
}

/// Owns every peer; the single entry point for connecting and broadcasting.
pub struct PeerGroup {
    shared: Arc<Shared>,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl PeerGroup {
    pub fn new(
        params: ProtocolConfig,
        chain: Arc<dyn ChainHead>,
        transport: Arc<dyn Transport>,
        config: PeerGroupConfig,
    ) -> PeerResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            params: Arc::new(params),
            config: RwLock::new(config),
            chain,
            transport,
            registry: RwLock::new(Registry::default()),
            events,
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            stop_lock: Mutex::new(()),
            stop_signal: Condvar::new(),
        });

        let weak = Arc::downgrade(&shared);
        let housekeeper = thread::Builder::new()
            .name("peer-group-housekeeping".to_owned())
            .spawn(move || run_housekeeping(weak))?;

        Ok(Self {
            shared,
            housekeeper: Mutex::new(Some(housekeeper)),
        })
    }

    /// Builds the transport from `kind`, then the group.
    pub fn with_transport_kind(
        params: ProtocolConfig,
        chain: Arc<dyn ChainHead>,
        kind: TransportKind,
        config: PeerGroupConfig,
    ) -> PeerResult<Self> {
        Self::new(params, chain, kind.build()?, config)
    }

    pub fn params(&self) -> &ProtocolConfig {
        &self.shared.params
    }

    /// Zero disables keep-alive pings.
    pub fn set_ping_interval(&self, interval: Duration) {
        self.shared.config.write().ping_interval = interval;
    }

    pub fn ping_interval(&self) -> Duration {
        self.shared.config.read().ping_interval
    }

    /// Replaces the filter loaded into peers that connect from now on.
    pub fn set_bloom_filter(&self, filter: Option<BloomFilter>) {
        self.shared.config.write().bloom_filter = filter;
    }

    /// Starts connecting to `addr`. Rejects an address already pending or
    /// ready with `AlreadyConnected`, leaving that peer untouched.
    pub fn connect_to(&self, addr: SocketAddr) -> PeerResult<PendingConnection> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(PeerError::ConnectionClosed);
        }
        let config = self.shared.config.read().clone();

        let peer = {
            let mut registry = self.shared.registry.write();
            if registry.peers().any(|p| p.remote_addr() == addr) {
                return Err(PeerError::AlreadyConnected { addr });
            }
            if registry.len() >= config.max_connections {
                return Err(PeerError::MaxConnectionsReached {
                    max: config.max_connections,
                });
            }

            let id = PeerId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
            let local = VersionMessage::from_config(
                &self.shared.params,
                addr,
                self.shared.chain.best_height(),
            );
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let peer = Peer::new(id, addr, self.shared.params.clone(), local, &config)
                .with_listener(Box::new(move |id, signal| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_peer_signal(id, signal);
                    }
                }));
            let peer = Arc::new(peer);
            registry.pending.insert(id, peer.clone());
            peer
        };

        tracing::debug!(peer = %peer.id(), addr = %addr, "Connecting");
        if let Err(e) = self
            .shared
            .transport
            .connect(addr, config.connect_timeout, peer.clone())
        {
            tracing::warn!(addr = %addr, error = %e, "Could not start connection");
            peer.close();
            return Err(e);
        }
        Ok(PendingConnection { peer })
    }

    /// Peers that completed the handshake.
    pub fn ready_peers(&self) -> Vec<Arc<Peer>> {
        self.shared.registry.read().ready.values().cloned().collect()
    }

    /// Peers still connecting or handshaking.
    pub fn pending_peers(&self) -> Vec<Arc<Peer>> {
        self.shared.registry.read().pending.values().cloned().collect()
    }

    /// Pending plus ready.
    pub fn peer_count(&self) -> usize {
        self.shared.registry.read().len()
    }

    pub fn peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.shared
            .registry
            .read()
            .peers()
            .find(|p| p.remote_addr() == addr)
            .cloned()
    }

    /// Sends `message` to every ready peer; returns how many accepted it.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        self.ready_peers()
            .iter()
            .filter(|peer| match peer.send(message) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(peer = %peer.id(), error = %e, "Failed to broadcast to peer");
                    false
                }
            })
            .count()
    }

    /// Closes the peer at `addr`, if any.
    pub fn disconnect(&self, addr: SocketAddr) -> bool {
        match self.peer(addr) {
            Some(peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerGroupEvent> {
        self.shared.events.subscribe()
    }

    /// Closes every peer and the transport. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.shared.stop_lock.lock();
            self.shared.stop_signal.notify_all();
        }
        for peer in self.shared.snapshot() {
            peer.close();
        }
        self.shared.transport.shutdown();
        if let Some(housekeeper) = self.housekeeper.lock().take() {
            if housekeeper.join().is_err() {
                tracing::warn!("Housekeeping thread panicked");
            }
        }
        tracing::info!("Peer group shut down");
    }
}

impl Drop for PeerGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_housekeeping(shared: Weak<Shared>) {
    loop {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }
        shared.housekeeping();

        let mut guard = shared.stop_lock.lock();
        if shared.stopping.load(Ordering::Acquire) {
            return;
        }
        shared.stop_signal.wait_for(&mut guard, HOUSEKEEPING_TICK);
    }
}
