// NOTE: Based on https://developer.bitcoin.org/devguide/p2p_network.html

//! Peer connection lifecycle for the bitcoin p2p network.
//!
//! A [`PeerGroup`] opens connections through a pluggable [`Transport`]
//! (thread-per-connection or a shared event loop), drives every [`Peer`]
//! through the version handshake and optional bloom filter negotiation, and
//! only then publishes it as ready. Ready peers are typed message channels.
//!
//! ```text
//! PeerGroup::connect_to(addr)
//!   └── Transport::connect ── bytes ──> Peer ── FrameDecoder ──> Handshake
//!                                        │
//!                                        └── InboundMessageQueue ──> consumer
//! ```

pub mod bloom;
pub mod config;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod peer_group;
pub mod queue;
pub mod transport;

pub use bloom::{BloomFilter, BloomUpdate};
pub use config::{PeerGroupConfig, ProtocolConfig};
pub use error::{MessageError, PeerError, PeerResult};
pub use handshake::{Handshake, PeerState};
pub use message::{FrameDecoder, Service, VersionMessage, WireMessage};
pub use peer::{Peer, PeerId};
pub use peer_group::{ChainHead, PeerGroup, PeerGroupEvent, PendingConnection};
pub use queue::InboundMessageQueue;
pub use transport::{BlockingTransport, NioTransport, Transport, TransportKind};

/// Testnet default port
pub const TEST_NET_PORT: u16 = 18333;
/// Mainnet default port
pub const MAIN_NET_PORT: u16 = 8333;
/// Default dns seed for testing, from bitcoin core client
pub const DEFAULT_DNS_SEED: &str = "seed.bitcoin.sipa.be";
/// Version of the p2p protocol spoken by this implementation
pub const BTC_PROTO_VERSION: i32 = 70002;
/// Lowest remote protocol version accepted during the handshake
pub const MIN_PEER_PROTO_VERSION: i32 = 31800;
/// First protocol version understanding `filterload`/`mempool` (BIP37)
pub const BLOOM_FILTER_MIN_VERSION: i32 = 70000;
/// From this version on, bloom support must be advertised with NODE_BLOOM (BIP111)
pub const NO_BLOOM_VERSION: i32 = 70011;
/// User agent sent in our version message
pub const USER_AGENT: &str = "/btc_peergroup:0.1.0/";
