//! Network parameters and pool configuration.

use std::time::Duration;

use crate::bloom::BloomFilter;
use crate::message::Service;
use crate::{
    BLOOM_FILTER_MIN_VERSION, BTC_PROTO_VERSION, MAIN_NET_PORT, MIN_PEER_PROTO_VERSION,
    TEST_NET_PORT, USER_AGENT,
};

/// Mainnet network magic.
pub const MAGIC_MAINNET: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];
/// Testnet3 network magic.
pub const MAGIC_TESTNET: [u8; 4] = [0x0b, 0x11, 0x09, 0x07];
/// Regtest magic, also used by unit tests.
pub const MAGIC_REGTEST: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default transport connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default keep-alive interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
/// Default upper bound on pending + ready peers.
pub const DEFAULT_MAX_CONNECTIONS: usize = 12;
/// Default number of undelivered messages buffered per peer.
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 10_000;

/// Immutable protocol parameters shared by every peer of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Identifies the originating network in every frame header.
    pub magic: [u8; 4],
    pub default_port: u16,
    /// Version we advertise.
    pub protocol_version: i32,
    /// Remotes below this version are refused.
    pub min_peer_protocol_version: i32,
    /// Minimum version on both sides for the filterload/mempool exchange.
    pub bloom_filter_min_version: i32,
    /// Refuse remotes that do not serve the block chain (NODE_NETWORK).
    pub require_block_chain: bool,
    pub user_agent: String,
    /// Services we advertise.
    pub services: u64,
}

impl ProtocolConfig {
    pub fn mainnet() -> Self {
        Self {
            magic: MAGIC_MAINNET,
            default_port: MAIN_NET_PORT,
            protocol_version: BTC_PROTO_VERSION,
            min_peer_protocol_version: MIN_PEER_PROTO_VERSION,
            bloom_filter_min_version: BLOOM_FILTER_MIN_VERSION,
            require_block_chain: true,
            user_agent: USER_AGENT.to_owned(),
            services: Service::UNNAMED,
        }
    }

    pub fn testnet() -> Self {
        Self {
            magic: MAGIC_TESTNET,
            default_port: TEST_NET_PORT,
            ..Self::mainnet()
        }
    }

    /// Parameters for tests against loopback peers.
    pub fn unit_test() -> Self {
        Self {
            magic: MAGIC_REGTEST,
            default_port: 18444,
            ..Self::mainnet()
        }
    }

    /// Whether our own protocol version allows the bloom filter exchange.
    pub fn local_supports_bloom(&self) -> bool {
        self.protocol_version >= self.bloom_filter_min_version
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::mainnet()
    }
}

/// Pool-wide policy for a [`PeerGroup`](crate::peer_group::PeerGroup).
#[derive(Debug, Clone)]
pub struct PeerGroupConfig {
    /// Keep-alive ping interval. `Duration::ZERO` disables pings.
    pub ping_interval: Duration,
    /// Deadline for a peer to reach ack exchange.
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on pending plus ready peers.
    pub max_connections: usize,
    pub inbound_queue_capacity: usize,
    /// Filter loaded into peers that support BIP37. `None` skips the exchange.
    pub bloom_filter: Option<BloomFilter>,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            bloom_filter: Some(BloomFilter::empty()),
        }
    }
}

impl PeerGroupConfig {
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity;
        self
    }

    pub fn with_bloom_filter(mut self, filter: Option<BloomFilter>) -> Self {
        self.bloom_filter = filter;
        self
    }

    /// Whether keep-alive pings are enabled.
    pub fn pings_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}
