//! One remote connection: handshake, keep-alive and the inbound message stream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::{PeerGroupConfig, ProtocolConfig};
use crate::error::{PeerError, PeerResult};
use crate::handshake::{Handshake, PeerState};
use crate::message::{encode, FrameDecoder, Message, VersionMessage, WireMessage};
use crate::queue::InboundMessageQueue;
use crate::transport::{ConnectionHandler, ConnectionWriter};

/// Identifies a peer within its group, independent of its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Lifecycle notifications a peer reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerSignal {
    Ready,
    Terminated(Option<PeerError>),
}

pub(crate) type PeerListener = Box<dyn Fn(PeerId, PeerSignal) + Send + Sync>;

#[derive(Debug, Default)]
struct PingState {
    outstanding: Option<(u64, Instant)>,
    last_sent: Option<Instant>,
    last_rtt: Option<Duration>,
}

struct Core {
    handshake: Handshake,
    decoder: FrameDecoder,
    failure: Option<PeerError>,
    ping: PingState,
    handshake_deadline: Instant,
}

/// Frames are never written with `core` held, so a stalled socket cannot
/// keep `close` or state queries waiting.
pub struct Peer {
    id: PeerId,
    remote_addr: RwLock<SocketAddr>,
    config: Arc<ProtocolConfig>,
    core: Mutex<Core>,
    writer: Mutex<Option<Arc<dyn ConnectionWriter>>>,
    inbound: InboundMessageQueue<WireMessage>,
    outcome: Mutex<Option<PeerResult<()>>>,
    outcome_set: Condvar,
    handshake_timeout: Duration,
    listener: Option<PeerListener>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}

impl Peer {
    /// A peer that will open with `local` as its version message once its
    /// transport connects.
    ///
    /// The handshake deadline runs `handshake_timeout` from the moment the
    /// transport connects; until then the connect timeout is added on top.
    pub fn new(
        id: PeerId,
        remote_addr: SocketAddr,
        config: Arc<ProtocolConfig>,
        local: VersionMessage,
        group_config: &PeerGroupConfig,
    ) -> Self {
        let decoder = FrameDecoder::new(config.magic);
        let handshake = Handshake::new(config.clone(), local, group_config.bloom_filter.clone());
        let handshake_deadline =
            Instant::now() + group_config.connect_timeout + group_config.handshake_timeout;
        Self {
            id,
            remote_addr: RwLock::new(remote_addr),
            config,
            core: Mutex::new(Core {
                handshake,
                decoder,
                failure: None,
                ping: PingState::default(),
                handshake_deadline,
            }),
            writer: Mutex::new(None),
            inbound: InboundMessageQueue::new(group_config.inbound_queue_capacity),
            outcome: Mutex::new(None),
            outcome_set: Condvar::new(),
            handshake_timeout: group_config.handshake_timeout,
            listener: None,
        }
    }

    pub(crate) fn with_listener(mut self, listener: PeerListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        *self.remote_addr.read()
    }

    /// Overrides the address this peer reports, so tests can give several
    /// loopback connections distinct identities. Not for production use:
    /// the socket is not affected.
    pub fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.write() = addr;
    }

    pub fn state(&self) -> PeerState {
        self.core.lock().handshake.state()
    }

    pub fn local_version(&self) -> VersionMessage {
        self.core.lock().handshake.local_version().clone()
    }

    /// The version message the remote sent, once accepted.
    pub fn remote_version(&self) -> Option<VersionMessage> {
        self.core.lock().handshake.remote_version().cloned()
    }

    /// min(local, remote) protocol version.
    pub fn negotiated_version(&self) -> Option<i32> {
        self.core.lock().handshake.negotiated_version()
    }

    /// Why the peer terminated, if it failed.
    pub fn failure(&self) -> Option<PeerError> {
        self.core.lock().failure.clone()
    }

    /// Round trip of the last answered keep-alive ping.
    pub fn last_ping_time(&self) -> Option<Duration> {
        self.core.lock().ping.last_rtt
    }

    /// Sends an application message. The peer must be ready.
    pub fn send(&self, message: &WireMessage) -> PeerResult<()> {
        match self.state() {
            PeerState::Ready => {}
            state if state.is_terminal() => return Err(PeerError::ConnectionClosed),
            state => return Err(PeerError::HandshakeIncomplete(state)),
        }
        let result = self.write_messages(std::slice::from_ref(message));
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    /// Blocks for the next received message; `ConnectionClosed` once the
    /// peer terminated and everything queued was consumed.
    pub fn next_message(&self) -> PeerResult<WireMessage> {
        self.inbound.pop()
    }

    /// Like [`next_message`](Self::next_message), `Ok(None)` on timeout.
    pub fn next_message_timeout(&self, timeout: Duration) -> PeerResult<Option<WireMessage>> {
        self.inbound.pop_timeout(timeout)
    }

    /// Single-pass stream of received messages, ending when the connection does.
    pub fn messages(&self) -> impl Iterator<Item = WireMessage> + '_ {
        std::iter::from_fn(move || self.inbound.pop().ok())
    }

    /// Closes the connection. Idempotent; wakes every waiter on this peer,
    /// including a send blocked on the socket.
    pub fn close(&self) {
        self.terminate(PeerState::Closed, None);
    }

    /// Blocks until the handshake completes or the peer terminates.
    /// `None` if `timeout` elapsed first.
    pub fn wait_for_handshake(&self, timeout: Option<Duration>) -> Option<PeerResult<()>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.outcome_set.wait_until(&mut outcome, deadline).timed_out() {
                        break;
                    }
                }
                None => self.outcome_set.wait(&mut outcome),
            }
        }
        outcome.clone()
    }

    /// Fails the peer if it has not reached ack exchange by its deadline.
    pub(crate) fn check_handshake_deadline(&self, now: Instant) {
        let expired = {
            let core = self.core.lock();
            now >= core.handshake_deadline && core.handshake.state().is_handshaking()
        };
        if expired {
            tracing::warn!(peer = %self.id, addr = %self.remote_addr(), "Handshake timed out");
            self.fail(PeerError::Timeout);
        }
    }

    /// Sends a keep-alive ping if `interval` passed since the last one.
    pub(crate) fn maybe_ping(&self, now: Instant, interval: Duration) {
        let nonce = {
            let mut core = self.core.lock();
            if core.handshake.state() != PeerState::Ready {
                return;
            }
            if core.ping.last_sent.is_some_and(|sent| now < sent + interval) {
                return;
            }
            let nonce: u64 = rand::random();
            core.ping.outstanding = Some((nonce, now));
            core.ping.last_sent = Some(now);
            nonce
        };
        if let Err(e) = self.write_messages(&[WireMessage::Ping(nonce)]) {
            self.fail(e);
        }
    }

    /// Must not be called with `core` held.
    fn write_messages(&self, messages: &[WireMessage]) -> PeerResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let writer = self
            .writer
            .lock()
            .clone()
            .ok_or(PeerError::ConnectionClosed)?;
        for message in messages {
            let bytes = encode(self.config.magic, message)?;
            writer.write(&bytes)?;
            tracing::debug!(peer = %self.id, command = message.name(), "Sent message");
        }
        Ok(())
    }

    fn process(&self, bytes: &[u8]) -> PeerResult<()> {
        {
            let mut core = self.core.lock();
            if core.handshake.state().is_terminal() {
                return Ok(());
            }
            core.decoder.extend(bytes);
        }

        loop {
            let (outgoing, ready) = {
                let mut core = self.core.lock();
                if core.handshake.state().is_terminal() {
                    return Ok(());
                }
                let Some(message) = core.decoder.next_message()? else {
                    return Ok(());
                };
                tracing::trace!(peer = %self.id, command = message.name(), "Received message");
                if core.handshake.state() == PeerState::Ready {
                    (self.handle_application(&mut core, message)?, false)
                } else {
                    let step = core.handshake.receive(&message)?;
                    (step.outgoing, step.ready)
                }
            };

            // Only the read path writes before Ready, so handshake frames stay in order.
            self.write_messages(&outgoing)?;
            if ready {
                {
                    let mut core = self.core.lock();
                    if core.handshake.state().is_terminal() {
                        return Ok(());
                    }
                    core.handshake.mark_ready()?;
                }
                self.publish_ready();
            }
        }
    }

    /// Returns the replies to write once `core` is released.
    fn handle_application(&self, core: &mut Core, message: WireMessage) -> PeerResult<Vec<WireMessage>> {
        // Rejects a second version/verack.
        core.handshake.receive(&message)?;
        match message {
            WireMessage::Ping(nonce) => Ok(vec![WireMessage::Pong(nonce)]),
            WireMessage::Pong(nonce) => {
                if let Some((expected, sent)) = core.ping.outstanding {
                    if expected == nonce {
                        let rtt = sent.elapsed();
                        tracing::debug!(peer = %self.id, rtt_ms = rtt.as_millis() as u64, "Pong received");
                        core.ping.last_rtt = Some(rtt);
                        core.ping.outstanding = None;
                    }
                }
                Ok(Vec::new())
            }
            other => {
                self.inbound
                    .push(other)
                    .map_err(|e| PeerError::ProtocolViolation {
                        state: PeerState::Ready,
                        message: e.to_string(),
                    })?;
                Ok(Vec::new())
            }
        }
    }

    fn publish_ready(&self) {
        tracing::info!(
            peer = %self.id,
            addr = %self.remote_addr(),
            version = ?self.negotiated_version(),
            "Handshake complete"
        );
        if let Some(listener) = &self.listener {
            listener(self.id, PeerSignal::Ready);
        }
        self.set_outcome(Ok(()));
    }

    fn fail(&self, error: PeerError) {
        self.terminate(PeerState::Failed, Some(error));
    }

    fn terminate(&self, state: PeerState, error: Option<PeerError>) {
        {
            let mut core = self.core.lock();
            if !core.handshake.terminate(state) {
                return;
            }
            core.failure = error.clone();
        }
        // Also fails a write in flight on another thread. on_connected
        // installs writers under `core`, so none can appear after this.
        self.close_writer();
        self.inbound.close();

        match &error {
            Some(e) => tracing::warn!(peer = %self.id, addr = %self.remote_addr(), error = %e, "Peer terminated"),
            None => tracing::info!(peer = %self.id, addr = %self.remote_addr(), "Peer closed"),
        }
        if let Some(listener) = &self.listener {
            listener(self.id, PeerSignal::Terminated(error.clone()));
        }
        self.set_outcome(Err(error.unwrap_or(PeerError::ConnectionClosed)));
    }

    fn close_writer(&self) {
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer.close();
        }
    }

    fn set_outcome(&self, result: PeerResult<()>) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(result);
            self.outcome_set.notify_all();
        }
    }
}

impl ConnectionHandler for Peer {
    fn on_connected(&self, writer: Arc<dyn ConnectionWriter>) {
        let step = {
            let mut core = self.core.lock();
            if core.handshake.state().is_terminal() {
                drop(core);
                writer.close();
                return;
            }
            core.handshake_deadline = Instant::now() + self.handshake_timeout;
            *self.writer.lock() = Some(writer);
            core.handshake.start()
        };
        if let Err(e) = step.and_then(|step| self.write_messages(&step.outgoing)) {
            self.fail(e);
        }
    }

    fn on_bytes(&self, bytes: &[u8]) {
        if let Err(e) = self.process(bytes) {
            self.fail(e);
        }
    }

    fn on_disconnected(&self) {
        let (state, error) = {
            let core = self.core.lock();
            let buffered = core.decoder.buffered();
            if buffered > 0 {
                let reason = format!("connection ended inside a frame ({buffered} bytes buffered)");
                (PeerState::Failed, PeerError::MalformedMessage(reason))
            } else if core.handshake.state() == PeerState::Ready {
                (PeerState::Closed, PeerError::Disconnected)
            } else {
                (PeerState::Failed, PeerError::Disconnected)
            }
        };
        self.terminate(state, Some(error));
    }
}
