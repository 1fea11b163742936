use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, BytesMut};
use sha2::{Digest, Sha256};

use crate::bloom::BloomFilter;
use crate::config::ProtocolConfig;
use crate::error::MessageError;
use crate::NO_BLOOM_VERSION;

/// A message that can be framed and transmitted to a peer.
pub trait Message {
    /// The message's name. i.e "verack"
    fn name(&self) -> &str;

    /// The message's payload, for messages that have one.
    fn payload(&self) -> Result<Option<Vec<u8>>, MessageError>;
}

/// A message's header. Present in all messages.
#[derive(Debug, PartialEq)]
pub struct Header {
    /// Identifies the originating network.
    magic: [u8; 4],
    /// ASCII strings that identifies the message's type. Padded with 0s.
    command_name: [u8; 12],
    /// Width of the payload, max of 32MiB.
    payload_size: u32,
    /// First 4 bytes of SHA256(SHA256(payload)).
    checksum: [u8; 4],
}

impl Header {
    /// Total size of the header
    pub const HEADER_WIDTH: usize = 24;
    pub const MAX_PAYLOAD_WIDTH: usize = 1024 * 1024 * 32;
    const CHECKSUM_WIDTH: usize = 4;
    const MAGIC_WIDTH: usize = 4;
    const COMMAND_NAME_WIDTH: usize = 12;

    // (SHA256(SHA256(""))), avoid computing it when payloads are empty.
    const EMPTY_CHECKSUM: [u8; Self::CHECKSUM_WIDTH] = [0x5d, 0xf6, 0xe0, 0xe2];

    /// The command name with its NUL padding stripped.
    pub fn command(&self) -> Result<&str, MessageError> {
        let end = self
            .command_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(Self::COMMAND_NAME_WIDTH);
        let name = &self.command_name[..end];
        if !name.is_ascii() || self.command_name[end..].iter().any(|b| *b != 0) {
            return Err(MessageError::InvalidCommandName(
                String::from_utf8_lossy(&self.command_name).into_owned(),
            ));
        }
        // ascii was checked above
        std::str::from_utf8(name)
            .map_err(|_| MessageError::InvalidCommandName(String::from_utf8_lossy(name).into()))
    }

    /// Generates the Header associated to a Command.
    // NOTE: The header is agnostic to the command/message itself.
    fn new(magic: [u8; 4], command: &str, payload: Option<&Vec<u8>>) -> Result<Self, MessageError> {
        let command_name = Self::command_name_from_str(command)?;

        let mut checksum = Self::EMPTY_CHECKSUM;
        let mut payload_size: u32 = 0;

        if let Some(payload) = payload {
            if payload.len() > Self::MAX_PAYLOAD_WIDTH {
                return Err(MessageError::PayloadOverSizeLimit {
                    size: payload.len(),
                    max: Self::MAX_PAYLOAD_WIDTH,
                });
            }
            payload_size = payload.len() as u32;
            checksum = Self::checksum_from_payload(payload);
        }

        Ok(Self {
            magic,
            command_name,
            payload_size,
            checksum,
        })
    }

    /// Generates bytes from a header
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut serialized_header = Vec::with_capacity(Self::HEADER_WIDTH);
        serialized_header.write_all(&self.magic)?;
        serialized_header.write_all(&self.command_name)?;
        serialized_header.write_u32::<LittleEndian>(self.payload_size)?;
        serialized_header.write_all(&self.checksum)?;
        Ok(serialized_header)
    }

    /// Generates a Header from exactly [`Header::HEADER_WIDTH`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() != Header::HEADER_WIDTH {
            return Err(MessageError::Malformed {
                command: "header".to_owned(),
                reason: format!(
                    "expected {} bytes, got {}",
                    Header::HEADER_WIDTH,
                    bytes.len()
                ),
            });
        }

        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; Self::MAGIC_WIDTH];
        cursor.read_exact(&mut magic)?;
        let mut command_name = [0u8; Self::COMMAND_NAME_WIDTH];
        cursor.read_exact(&mut command_name)?;
        let payload_size = cursor.read_u32::<LittleEndian>()?;
        let mut checksum = [0u8; Self::CHECKSUM_WIDTH];
        cursor.read_exact(&mut checksum)?;

        Ok(Self {
            magic,
            command_name,
            payload_size,
            checksum,
        })
    }

    /// Generates a [u8; 12] from an ascii string, padding with 0s when needed.
    fn command_name_from_str(name: &str) -> Result<[u8; 12], MessageError> {
        if !name.is_ascii() {
            return Err(MessageError::InvalidCommandName(format!(
                "command: '{name}' should only contain ASCII characters.",
            )));
        }

        if name.len() > Self::COMMAND_NAME_WIDTH {
            return Err(MessageError::InvalidCommandName(format!(
                "name: '{name}' has length {} which is more than the allowed max {}.",
                name.len(),
                Self::COMMAND_NAME_WIDTH
            )));
        }

        let mut formatted_name = [0u8; Self::COMMAND_NAME_WIDTH];
        formatted_name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(formatted_name)
    }

    /// Generates the checksum SHA256(SHA256(payload)).
    fn checksum_from_payload(payload: &[u8]) -> [u8; Self::CHECKSUM_WIDTH] {
        let hash = Sha256::digest(Sha256::digest(payload));
        let mut checksum = [0u8; Self::CHECKSUM_WIDTH];
        checksum.copy_from_slice(&hash[..Self::CHECKSUM_WIDTH]);
        checksum
    }
}

/// A serialized message that can be sent over the wire.
pub fn serialize_message<T: Message + ?Sized>(
    magic: [u8; 4],
    message: &T,
) -> Result<Vec<u8>, MessageError> {
    let payload = message.payload()?;
    let header = Header::new(magic, message.name(), payload.as_ref())?;

    let mut serialized_message = header.to_bytes()?;

    // message has a payload/body: append it after the header.
    if let Some(p) = payload {
        serialized_message.extend(p);
    }
    Ok(serialized_message)
}

/// Service bits advertised in version messages.
pub struct Service;

impl Service {
    pub const UNNAMED: u64 = 0x00;
    pub const NODE_NETWORK: u64 = 0x01;
    pub const NODE_GETUTXO: u64 = 0x02;
    pub const NODE_BLOOM: u64 = 0x04;
    pub const NODE_WITNESS: u64 = 0x08;
    pub const NODE_XTHIN: u64 = 0x10;
    pub const NODE_NETWORK_LIMITED: u64 = 0x0400;
}

/// The first and primary messages in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// The highest protocol version understood by the transmitting node
    pub version: i32,
    /// The services supported by the transmitting node encoded as a bitfield
    pub service: u64,
    /// The current Unix epoch time according to the transmitting node’s clock
    pub timestamp: i64,
    /// The services supported by the receiving node as perceived by the transmitting node
    pub addr_recv_services: u64,
    /// The IPv6 address of the receiving node as perceived by the transmitting node
    pub addr_recv_ip: [u8; 16],
    /// The port number of the receiving node as perceived by the transmitting node
    pub addr_recv_port: u16,
    /// The services supported by the transmitting node
    pub addr_trans_services: u64,
    /// The IPv6 address of the transmitting node
    pub addr_trans_ip: [u8; 16],
    /// The port number of the transmitting node
    pub addr_trans_port: u16,
    /// A random nonce which can help a node detect a connection to itself.
    /// If the nonce is 0, the nonce field is ignored
    pub nonce: u64,
    /// The user agent, empty when none is sent.
    pub user_agent: String,
    /// The height of the transmitting node’s best block chain
    pub start_height: i32,
    /// Transaction relay flag
    pub relay: bool,
}

impl VersionMessage {
    /// Ctor that uses the most probable values.
    /// Takes in the statically unknown fields as params: target and local addr.
    pub fn new_with_defaults(addr_recv: SocketAddr, addr_trans: SocketAddr) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        Self {
            version: crate::BTC_PROTO_VERSION,
            service: Service::NODE_NETWORK,
            timestamp,
            addr_recv_services: Service::NODE_NETWORK,
            addr_recv_ip: ipv6_octets(&addr_recv),
            addr_recv_port: addr_recv.port(),
            addr_trans_services: Service::NODE_NETWORK,
            addr_trans_ip: ipv6_octets(&addr_trans),
            addr_trans_port: addr_trans.port(),
            nonce: rand::random(),
            user_agent: String::new(),
            start_height: 0,
            relay: true,
        }
    }

    /// The version message we open a connection to `remote` with.
    pub fn from_config(config: &ProtocolConfig, remote: SocketAddr, best_height: i32) -> Self {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut msg = Self::new_with_defaults(remote, unspecified);
        msg.version = config.protocol_version;
        msg.service = config.services;
        msg.addr_trans_services = config.services;
        msg.user_agent = config.user_agent.clone();
        msg.start_height = best_height;
        // No transactions until a filter is loaded.
        msg.relay = false;
        msg
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_services(mut self, services: u64) -> Self {
        self.service = services;
        self.addr_trans_services = services;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_start_height(mut self, height: i32) -> Self {
        self.start_height = height;
        self
    }

    /// Whether the sender serves the full block chain.
    pub fn has_block_chain(&self) -> bool {
        self.service & Service::NODE_NETWORK != 0
    }

    /// Whether the sender understands `filterload` and `mempool`.
    pub fn is_bloom_filtering_supported(&self, min_version: i32) -> bool {
        if self.version < min_version {
            return false;
        }
        self.version < NO_BLOOM_VERSION || self.service & Service::NODE_BLOOM != 0
    }

    fn from_payload(payload: &[u8]) -> Result<Self, MessageError> {
        let mut cursor = Cursor::new(payload);

        let version = cursor.read_i32::<LittleEndian>()?;
        let service = cursor.read_u64::<LittleEndian>()?;
        let timestamp = cursor.read_i64::<LittleEndian>()?;

        let addr_recv_services = cursor.read_u64::<LittleEndian>()?;
        let mut addr_recv_ip = [0u8; 16];
        cursor.read_exact(&mut addr_recv_ip)?;
        let addr_recv_port = cursor.read_u16::<BigEndian>()?;

        let addr_trans_services = cursor.read_u64::<LittleEndian>()?;
        let mut addr_trans_ip = [0u8; 16];
        cursor.read_exact(&mut addr_trans_ip)?;
        let addr_trans_port = cursor.read_u16::<BigEndian>()?;

        let nonce = cursor.read_u64::<LittleEndian>()?;
        let user_agent = read_var_str(&mut cursor)?;
        let start_height = cursor.read_i32::<LittleEndian>()?;
        // BIP37: absent means relay.
        let relay = match cursor.read_u8() {
            Ok(flag) => flag != 0,
            Err(_) => true,
        };

        Ok(Self {
            version,
            service,
            timestamp,
            addr_recv_services,
            addr_recv_ip,
            addr_recv_port,
            addr_trans_services,
            addr_trans_ip,
            addr_trans_port,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

impl Message for VersionMessage {
    fn name(&self) -> &str {
        "version"
    }

    fn payload(&self) -> Result<Option<Vec<u8>>, MessageError> {
        let mut payload: Vec<u8> = Vec::with_capacity(86 + self.user_agent.len());

        payload.write_i32::<LittleEndian>(self.version)?;
        payload.write_u64::<LittleEndian>(self.service)?;
        payload.write_i64::<LittleEndian>(self.timestamp)?;

        // rx end
        payload.write_u64::<LittleEndian>(self.addr_recv_services)?;
        payload.write_all(&self.addr_recv_ip)?;
        payload.write_u16::<BigEndian>(self.addr_recv_port)?;

        // tx end
        payload.write_u64::<LittleEndian>(self.addr_trans_services)?;
        payload.write_all(&self.addr_trans_ip)?;
        payload.write_u16::<BigEndian>(self.addr_trans_port)?;

        payload.write_u64::<LittleEndian>(self.nonce)?;
        write_var_int(&mut payload, self.user_agent.len() as u64)?;
        payload.write_all(self.user_agent.as_bytes())?;
        payload.write_i32::<LittleEndian>(self.start_height)?;
        payload.write_u8(self.relay.into())?;

        Ok(Some(payload))
    }
}

/// Every message kind the peer layer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Version(VersionMessage),
    /// Version Acknowledgement. Payload-less command.
    VerAck,
    /// BIP37 `filterload`.
    FilterLoad(BloomFilter),
    /// Request for the remote's unconfirmed transactions. Payload-less.
    MemPool,
    Ping(u64),
    Pong(u64),
    /// Any command this layer does not interpret, kept opaque.
    Unknown { command: String, payload: Vec<u8> },
}

impl WireMessage {
    /// Builds a message from a command name and its already verified payload.
    pub fn from_parts(command: &str, payload: &[u8]) -> Result<Self, MessageError> {
        let message = match command {
            "version" => WireMessage::Version(VersionMessage::from_payload(payload)?),
            "verack" | "mempool" if !payload.is_empty() => {
                return Err(MessageError::Malformed {
                    command: command.to_owned(),
                    reason: format!("unexpected {} byte payload", payload.len()),
                })
            }
            "verack" => WireMessage::VerAck,
            "filterload" => WireMessage::FilterLoad(BloomFilter::from_payload(payload)?),
            "mempool" => WireMessage::MemPool,
            // pre-BIP31 pings carry no nonce
            "ping" if payload.is_empty() => WireMessage::Ping(0),
            "ping" => WireMessage::Ping(Cursor::new(payload).read_u64::<LittleEndian>()?),
            "pong" => WireMessage::Pong(Cursor::new(payload).read_u64::<LittleEndian>()?),
            other => WireMessage::Unknown {
                command: other.to_owned(),
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }

    /// Whether this message belongs to the version handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(self, WireMessage::Version(_) | WireMessage::VerAck)
    }
}

impl Message for WireMessage {
    fn name(&self) -> &str {
        match self {
            WireMessage::Version(version) => version.name(),
            WireMessage::VerAck => "verack",
            WireMessage::FilterLoad(filter) => filter.name(),
            WireMessage::MemPool => "mempool",
            WireMessage::Ping(_) => "ping",
            WireMessage::Pong(_) => "pong",
            WireMessage::Unknown { command, .. } => command,
        }
    }

    fn payload(&self) -> Result<Option<Vec<u8>>, MessageError> {
        match self {
            WireMessage::Version(version) => version.payload(),
            WireMessage::FilterLoad(filter) => filter.payload(),
            WireMessage::VerAck | WireMessage::MemPool => Ok(None),
            WireMessage::Ping(nonce) | WireMessage::Pong(nonce) => {
                Ok(Some(nonce.to_le_bytes().to_vec()))
            }
            WireMessage::Unknown { payload, .. } => Ok(Some(payload.clone())),
        }
    }
}

/// Frames `message` for the network identified by `magic`.
pub fn encode(magic: [u8; 4], message: &WireMessage) -> Result<Vec<u8>, MessageError> {
    serialize_message(magic, message)
}

/// Decodes one frame from the front of `bytes`.
///
/// Returns `Ok(None)` when `bytes` does not yet hold a whole frame, otherwise
/// the message and how many bytes it consumed.
pub fn decode(magic: [u8; 4], bytes: &[u8]) -> Result<Option<(WireMessage, usize)>, MessageError> {
    if bytes.len() < Header::HEADER_WIDTH {
        return Ok(None);
    }
    let header = Header::from_bytes(&bytes[..Header::HEADER_WIDTH])?;
    if header.magic != magic {
        return Err(MessageError::BadMagic {
            expected: magic,
            actual: header.magic,
        });
    }
    let command = header.command()?;
    let size = header.payload_size as usize;
    if size > Header::MAX_PAYLOAD_WIDTH {
        return Err(MessageError::PayloadOverSizeLimit {
            size,
            max: Header::MAX_PAYLOAD_WIDTH,
        });
    }

    let total = Header::HEADER_WIDTH + size;
    if bytes.len() < total {
        return Ok(None);
    }
    let payload = &bytes[Header::HEADER_WIDTH..total];
    if Header::checksum_from_payload(payload) != header.checksum {
        return Err(MessageError::ChecksumMismatch {
            command: command.to_owned(),
        });
    }

    tracing::debug!("command received: {:?}", command);
    let message = WireMessage::from_parts(command, payload)?;
    Ok(Some((message, total)))
}

/// Reassembles frames from arbitrarily chunked transport reads.
#[derive(Debug)]
pub struct FrameDecoder {
    magic: [u8; 4],
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            buffer: BytesMut::with_capacity(Header::HEADER_WIDTH),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete message, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<WireMessage>, MessageError> {
        match decode(self.magic, &self.buffer)? {
            Some((message, consumed)) => {
                self.buffer.advance(consumed);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Writes a CompactSize integer.
pub fn write_var_int<W: Write>(writer: &mut W, value: u64) -> Result<(), MessageError> {
    match value {
        0..=0xfc => writer.write_u8(value as u8)?,
        0xfd..=0xffff => {
            writer.write_u8(0xfd)?;
            writer.write_u16::<LittleEndian>(value as u16)?;
        }
        0x1_0000..=0xffff_ffff => {
            writer.write_u8(0xfe)?;
            writer.write_u32::<LittleEndian>(value as u32)?;
        }
        _ => {
            writer.write_u8(0xff)?;
            writer.write_u64::<LittleEndian>(value)?;
        }
    }
    Ok(())
}

/// Reads a CompactSize integer.
pub fn read_var_int<R: Read>(reader: &mut R) -> Result<u64, MessageError> {
    let value = match reader.read_u8()? {
        0xfd => reader.read_u16::<LittleEndian>()? as u64,
        0xfe => reader.read_u32::<LittleEndian>()? as u64,
        0xff => reader.read_u64::<LittleEndian>()?,
        small => small as u64,
    };
    Ok(value)
}

fn read_var_str(cursor: &mut Cursor<&[u8]>) -> Result<String, MessageError> {
    let len = read_var_int(cursor)? as usize;
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(MessageError::Malformed {
            command: "version".to_owned(),
            reason: format!("string of {len} bytes with only {remaining} left"),
        });
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn ipv6_octets(addr: &SocketAddr) -> [u8; 16] {
    match addr.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    }
    .octets()
}
