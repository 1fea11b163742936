//! The version handshake as a transport-free state machine.
//!
//! [`Handshake`] consumes received messages one at a time and answers with
//! the frames to send next, so it can be driven message-by-message in tests
//! and bound to any transport by [`Peer`](crate::peer::Peer).

use std::fmt;
use std::sync::Arc;

use crate::bloom::BloomFilter;
use crate::config::ProtocolConfig;
use crate::error::{PeerError, PeerResult};
use crate::message::{Message, VersionMessage, WireMessage};

/// States a connection goes through. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub enum PeerState {
    /// Transport connect in progress.
    #[default]
    Connecting,
    /// Our version is out, waiting for theirs.
    VersionSent,
    /// Their version was accepted and our verack sent, waiting for theirs.
    VersionReceived,
    /// Both veracks seen; capability frames may follow.
    AckExchanged,
    /// Handshake complete, the peer carries application traffic.
    Ready,
    /// Terminated by an error.
    Failed,
    /// Terminated by a local close or an orderly remote disconnect.
    Closed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }

    /// Whether ack exchange has not happened yet, so the handshake deadline applies.
    pub fn is_handshaking(&self) -> bool {
        *self < PeerState::AckExchanged
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::VersionSent => write!(f, "version_sent"),
            PeerState::VersionReceived => write!(f, "version_received"),
            PeerState::AckExchanged => write!(f, "ack_exchanged"),
            PeerState::Ready => write!(f, "ready"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// What the caller must do after feeding the handshake a message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// Frames to write, in order.
    pub outgoing: Vec<WireMessage>,
    /// Set once ack exchange completed; the caller marks the peer ready after writing `outgoing`.
    pub ready: bool,
}

#[derive(Debug)]
pub struct Handshake {
    state: PeerState,
    config: Arc<ProtocolConfig>,
    local: VersionMessage,
    remote: Option<VersionMessage>,
    bloom_filter: Option<BloomFilter>,
}

impl Handshake {
    pub fn new(
        config: Arc<ProtocolConfig>,
        local: VersionMessage,
        bloom_filter: Option<BloomFilter>,
    ) -> Self {
        Self {
            state: PeerState::Connecting,
            config,
            local,
            remote: None,
            bloom_filter,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn local_version(&self) -> &VersionMessage {
        &self.local
    }

    pub fn remote_version(&self) -> Option<&VersionMessage> {
        self.remote.as_ref()
    }

    /// min(local, remote) once the remote version is known.
    pub fn negotiated_version(&self) -> Option<i32> {
        self.remote
            .as_ref()
            .map(|remote| remote.version.min(self.local.version))
    }

    /// Whether the filterload/mempool exchange happens on this connection.
    pub fn negotiates_bloom(&self) -> bool {
        self.bloom_filter.is_some()
            && self.config.local_supports_bloom()
            && self
                .remote
                .as_ref()
                .is_some_and(|r| r.is_bloom_filtering_supported(self.config.bloom_filter_min_version))
    }

    /// Transport is up: our version goes out first, without waiting for the remote.
    pub fn start(&mut self) -> PeerResult<Step> {
        if self.state != PeerState::Connecting {
            return Err(self.violation("connection started twice"));
        }
        self.transition(PeerState::VersionSent);
        Ok(Step {
            outgoing: vec![WireMessage::Version(self.local.clone())],
            ready: false,
        })
    }

    /// Feeds one received message. Errors are fatal to the connection.
    pub fn receive(&mut self, message: &WireMessage) -> PeerResult<Step> {
        match (self.state, message) {
            (PeerState::VersionSent, WireMessage::Version(remote)) => {
                self.accept_version(remote)?;
                self.transition(PeerState::VersionReceived);
                Ok(Step {
                    outgoing: vec![WireMessage::VerAck],
                    ready: false,
                })
            }
            (PeerState::VersionReceived, WireMessage::VerAck) => {
                self.transition(PeerState::AckExchanged);
                let mut outgoing = Vec::new();
                if self.negotiates_bloom() {
                    if let Some(filter) = &self.bloom_filter {
                        outgoing.push(WireMessage::FilterLoad(filter.clone()));
                        outgoing.push(WireMessage::MemPool);
                    }
                }
                Ok(Step {
                    outgoing,
                    ready: true,
                })
            }
            (PeerState::Ready, msg) if !msg.is_handshake() => Ok(Step::default()),
            (state, msg) => Err(self.violation(format!("unexpected '{}' in state {state}", msg.name()))),
        }
    }

    /// Completes the handshake once the capability frames have been written.
    pub fn mark_ready(&mut self) -> PeerResult<()> {
        if self.state != PeerState::AckExchanged {
            return Err(self.violation("ready before ack exchange"));
        }
        self.transition(PeerState::Ready);
        Ok(())
    }

    /// Moves to a terminal state. Returns false if already terminal.
    pub fn terminate(&mut self, state: PeerState) -> bool {
        debug_assert!(state.is_terminal());
        if self.state.is_terminal() {
            return false;
        }
        self.transition(state);
        true
    }

    fn accept_version(&mut self, remote: &VersionMessage) -> PeerResult<()> {
        if self.config.require_block_chain && !remote.has_block_chain() {
            return Err(PeerError::HandshakeRejected(format!(
                "peer does not serve the block chain (services {:#x})",
                remote.service
            )));
        }
        if remote.version < self.config.min_peer_protocol_version {
            return Err(PeerError::HandshakeRejected(format!(
                "protocol version {} below minimum {}",
                remote.version, self.config.min_peer_protocol_version
            )));
        }
        if remote.nonce != 0 && remote.nonce == self.local.nonce {
            return Err(PeerError::HandshakeRejected("connected to self".to_owned()));
        }

        tracing::debug!(
            version = remote.version,
            services = remote.service,
            user_agent = %remote.user_agent,
            height = remote.start_height,
            "Accepted remote version"
        );
        self.remote = Some(remote.clone());
        Ok(())
    }

    fn transition(&mut self, to: PeerState) {
        tracing::debug!(from = %self.state, to = %to, "Peer state transition");
        self.state = to;
    }

    fn violation(&self, message: impl Into<String>) -> PeerError {
        PeerError::ProtocolViolation {
            state: self.state,
            message: message.into(),
        }
    }
}
