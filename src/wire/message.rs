use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::net::{IpAddr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::bloom::BloomFilter;
use crate::error::{MessageError, MessageResult};
use crate::ledger::{Bitcoin, Ledger, WireCodec};
use crate::wire::constants::{COMMAND_SIZE, PROTOCOL_VERSION};
use crate::wire::inventory::{AsHash, Hash256, InventoryItem};

/// Implemented by payload types that can be decoded from a whole message payload.
pub trait Decode: Sized {
    fn decode(payload: &[u8]) -> MessageResult<Self>;
}

/// Implemented by payload types that know their own wire form.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// A decoded Bitcoin P2P message.
///
/// Each variant corresponds to one protocol command. Blocks, headers,
/// transactions and merkle blocks are held as the ledger's own types; an
/// absent ledger value encodes as an empty payload.
///
/// See:
/// https://developer.bitcoin.org/reference/p2p_networking.html
#[derive(Debug, Clone, PartialEq)]
pub enum Message<L: Ledger = Bitcoin> {
    Version(Version),
    VerAck,
    Ping(Ping),
    Pong(Pong),
    Addr(Vec<AddrEntry>),
    Inventory(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    NotFound(Vec<InventoryItem>),
    GetBlocks(BlockLocator),
    GetHeaders(BlockLocator),
    Headers(Vec<L::BlockHeader>),
    Tx(Option<L::Transaction>),
    Block(Option<L::Block>),
    MerkleBlock(Option<L::MerkleBlock>),
    FilterLoad(Option<BloomFilter>),
    FilterAdd(FilterAdd),
    FilterClear,
    Mempool,
    GetAddr,
    Alert(Alert),
    Reject(Option<Reject>),
}

impl<L: Ledger> Message<L> {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::VerAck => Command::VerAck,
            Message::Ping(_) => Command::Ping,
            Message::Pong(_) => Command::Pong,
            Message::Addr(_) => Command::Addr,
            Message::Inventory(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::NotFound(_) => Command::NotFound,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::GetHeaders(_) => Command::GetHeaders,
            Message::Headers(_) => Command::Headers,
            Message::Tx(_) => Command::Tx,
            Message::Block(_) => Command::Block,
            Message::MerkleBlock(_) => Command::MerkleBlock,
            Message::FilterLoad(_) => Command::FilterLoad,
            Message::FilterAdd(_) => Command::FilterAdd,
            Message::FilterClear => Command::FilterClear,
            Message::Mempool => Command::Mempool,
            Message::GetAddr => Command::GetAddr,
            Message::Alert(_) => Command::Alert,
            Message::Reject(_) => Command::Reject,
        }
    }

    /// Serializes the payload (everything after the 24-byte frame header).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Version(v) => v.encode(&mut out),
            Message::Ping(p) => p.encode(&mut out),
            Message::Pong(p) => p.encode(&mut out),
            Message::Addr(entries) => entries.encode(&mut out),
            Message::Inventory(items) | Message::GetData(items) | Message::NotFound(items) => {
                items.encode(&mut out)
            }
            Message::GetBlocks(locator) | Message::GetHeaders(locator) => locator.encode(&mut out),
            Message::Headers(headers) => crate::wire::payload::write_headers::<L>(headers, &mut out),
            Message::Tx(Some(tx)) => out.extend(WireCodec::encode(tx)),
            Message::Block(Some(block)) => out.extend(WireCodec::encode(block)),
            Message::MerkleBlock(Some(mb)) => out.extend(WireCodec::encode(mb)),
            Message::FilterLoad(filter) => {
                if let Some(filter) = filter {
                    filter.write_to(&mut out);
                }
            }
            Message::FilterAdd(f) => f.encode(&mut out),
            Message::Alert(a) => a.encode(&mut out),
            Message::Reject(r) => {
                if let Some(r) = r {
                    r.encode(&mut out);
                }
            }
            Message::Tx(None) | Message::Block(None) | Message::MerkleBlock(None) => {}
            Message::VerAck | Message::FilterClear | Message::Mempool | Message::GetAddr => {}
        }
        out
    }

    /// Builds the variant for `command` from its payload bytes.
    pub fn decode_payload(command: Command, payload: &[u8]) -> MessageResult<Self> {
        crate::wire::decode::decode_message(command, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Control
    Version,
    VerAck,
    Ping,
    Pong,
    Addr,
    GetAddr,
    Alert,
    Reject,
    // Data
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Headers,
    Tx,
    Block,
    MerkleBlock,
    Mempool,
    // Bloom filter
    FilterLoad,
    FilterAdd,
    FilterClear,
}

impl Command {
    /// Every command this crate can build or parse.
    pub const ALL: [Command; 21] = [
        Command::Version,
        Command::VerAck,
        Command::Ping,
        Command::Pong,
        Command::Addr,
        Command::GetAddr,
        Command::Alert,
        Command::Reject,
        Command::Inv,
        Command::GetData,
        Command::NotFound,
        Command::GetBlocks,
        Command::GetHeaders,
        Command::Headers,
        Command::Tx,
        Command::Block,
        Command::MerkleBlock,
        Command::Mempool,
        Command::FilterLoad,
        Command::FilterAdd,
        Command::FilterClear,
    ];

    /// The lowercase ASCII name used in the frame header.
    pub fn name(self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::VerAck => "verack",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Addr => "addr",
            Command::GetAddr => "getaddr",
            Command::Alert => "alert",
            Command::Reject => "reject",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::NotFound => "notfound",
            Command::GetBlocks => "getblocks",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::Tx => "tx",
            Command::Block => "block",
            Command::MerkleBlock => "merkleblock",
            Command::Mempool => "mempool",
            Command::FilterLoad => "filterload",
            Command::FilterAdd => "filteradd",
            Command::FilterClear => "filterclear",
        }
    }

    pub fn from_name(name: &str) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Returns the 12-byte command field as defined by the Bitcoin P2P protocol.
    ///
    /// The command string is ASCII and padded with zero bytes.
    pub fn as_bytes(self) -> [u8; COMMAND_SIZE] {
        let name = self.name().as_bytes();
        let mut padded = [0u8; COMMAND_SIZE];
        padded[..name.len()].copy_from_slice(name);
        padded
    }

    /// `inv`, `getdata` and `notfound` carry inventory vectors.
    pub fn is_inventory(self) -> bool {
        matches!(self, Command::Inv | Command::GetData | Command::NotFound)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.name())
    }
}

/// Network address as carried by `version` and `addr`.
///
/// IPv4 addresses travel as IPv4-mapped IPv6 (`::ffff:a.b.c.d`) and are
/// turned back into [`IpAddr::V4`] when decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    pub services: Services,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddr {
    pub fn new(services: Services, ip: IpAddr, port: u16) -> Self {
        Self { services, ip, port }
    }

    /// The 16-byte wire form of the address.
    pub fn ip_bytes(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    pub fn from_ip_bytes(services: Services, bytes: [u8; 16], port: u16) -> Self {
        let v6 = Ipv6Addr::from(bytes);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        Self { services, ip, port }
    }
}

impl Default for NetAddr {
    fn default() -> Self {
        Self {
            services: Services::NONE,
            ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// Payload of the `version` handshake message.
///
/// ```text
/// int32    version
/// uint64   services
/// int64    timestamp
/// net_addr addr_recv
/// net_addr addr_from
/// uint64   nonce
/// var_str  subversion
/// int32    start_height
/// bool     relay          (optional, BIP37)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version: i32,
    pub services: Services,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub subversion: String,
    pub start_height: i32,
    /// Absent on the wire means `true`.
    pub relay: bool,
}

impl Version {
    /// A fresh `version` with a random nonce and the current time.
    pub fn new(protocol_version: i32) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        Self {
            version: protocol_version,
            services: Services::NODE_NETWORK,
            timestamp,
            addr_recv: NetAddr::default(),
            addr_from: NetAddr::default(),
            nonce: rand::thread_rng().gen(),
            subversion: default_subversion(),
            start_height: 0,
            relay: true,
        }
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_start_height(mut self, start_height: i32) -> Self {
        self.start_height = start_height;
        self
    }

    pub fn with_subversion(mut self, subversion: impl Into<String>) -> Self {
        self.subversion = subversion.into();
        self
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

fn default_subversion() -> String {
    format!("/btc-p2p:{}/", env!("CARGO_PKG_VERSION"))
}

const NONCE_ARGUMENT: &str = "First argument is expected to be an 8 byte buffer";

macro_rules! nonce_message {
    ($name:ident) => {
        /// Keepalive ping. The nonce is 8 bytes, or empty for peers that
        /// predate BIP0031.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub nonce: Vec<u8>,
        }

        impl $name {
            /// A message with a fresh random 8-byte nonce.
            pub fn new() -> Self {
                let mut nonce = [0u8; 8];
                rand::thread_rng().fill(&mut nonce);
                Self { nonce: nonce.to_vec() }
            }

            /// Wraps an explicit nonce, which must be exactly 8 bytes.
            pub fn with_nonce(nonce: &[u8]) -> MessageResult<Self> {
                if nonce.len() != 8 {
                    return Err(MessageError::InvalidArgument(NONCE_ARGUMENT.to_string()));
                }
                Ok(Self { nonce: nonce.to_vec() })
            }

            /// Nonce-less form sent to legacy peers.
            pub fn legacy() -> Self {
                Self { nonce: Vec::new() }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::legacy()
            }
        }
    };
}

nonce_message!(Ping);
nonce_message!(Pong);

impl Ping {
    /// The `pong` answering this ping.
    pub fn reply(&self) -> Pong {
        Pong {
            nonce: self.nonce.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub timestamp: u32,
    pub addr: NetAddr,
}

/// Payload of `getblocks` and `getheaders`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    pub version: u32,
    pub starts: Vec<Hash256>,
    pub stop: Hash256,
}

impl BlockLocator {
    /// Locator with a zero stop hash. String hashes are display-order hex.
    pub fn new<I>(version: u32, starts: I) -> MessageResult<Self>
    where
        I: IntoIterator,
        I::Item: AsHash,
    {
        let starts = starts
            .into_iter()
            .map(|h| h.to_hash())
            .collect::<MessageResult<Vec<_>>>()?;
        Ok(Self {
            version,
            starts,
            stop: Hash256::ZERO,
        })
    }

    pub fn with_stop<H: AsHash + ?Sized>(mut self, stop: &H) -> MessageResult<Self> {
        self.stop = stop.to_hash()?;
        Ok(self)
    }
}

impl Default for BlockLocator {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            starts: Vec::new(),
            stop: Hash256::ZERO,
        }
    }
}

/// Data element for `filteradd`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterAdd {
    pub data: Vec<u8>,
}

impl FilterAdd {
    pub fn new(data: impl Into<Vec<u8>>) -> MessageResult<Self> {
        let data = data.into();
        if data.len() > crate::bloom::MAX_SCRIPT_ELEMENT_SIZE {
            return Err(MessageError::InvalidArgument(format!(
                "filteradd element is {} bytes, max {}",
                data.len(),
                crate::bloom::MAX_SCRIPT_ELEMENT_SIZE
            )));
        }
        Ok(Self { data })
    }
}

/// Opaque legacy `alert`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Alert {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Reject codes defined by BIP61.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RejectCode(pub u8);

impl RejectCode {
    pub const MALFORMED: RejectCode = RejectCode(0x01);
    pub const INVALID: RejectCode = RejectCode(0x10);
    pub const OBSOLETE: RejectCode = RejectCode(0x11);
    pub const DUPLICATE: RejectCode = RejectCode(0x12);
    pub const NONSTANDARD: RejectCode = RejectCode(0x40);
    pub const DUST: RejectCode = RejectCode(0x41);
    pub const INSUFFICIENT_FEE: RejectCode = RejectCode(0x42);
    pub const CHECKPOINT: RejectCode = RejectCode(0x43);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            RejectCode::MALFORMED => "REJECT_MALFORMED",
            RejectCode::INVALID => "REJECT_INVALID",
            RejectCode::OBSOLETE => "REJECT_OBSOLETE",
            RejectCode::DUPLICATE => "REJECT_DUPLICATE",
            RejectCode::NONSTANDARD => "REJECT_NONSTANDARD",
            RejectCode::DUST => "REJECT_DUST",
            RejectCode::INSUFFICIENT_FEE => "REJECT_INSUFFICIENTFEE",
            RejectCode::CHECKPOINT => "REJECT_CHECKPOINT",
            _ => return None,
        })
    }
}

impl Debug for RejectCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.name() {
            Some(name) => write!(f, "RejectCode({name})"),
            None => write!(f, "RejectCode(0x{:02x})", self.0),
        }
    }
}

/// Payload of `reject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// Command of the rejected message.
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Usually the hash of the rejected object.
    pub data: Vec<u8>,
}

/// Service flags as defined by the Bitcoin P2P protocol.
///
/// This is a bitfield (`u64`) transmitted in the `version` message.
/// Each bit represents a capability supported by the node.
///
/// Official reference:
/// https://developer.bitcoin.org/reference/p2p_networking.html#version
///
/// The flags are forward-compatible: unknown bits must be preserved.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Services(u64);

impl Services {
    /// Creates a new `Services` from raw bits.
    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bitfield value.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns true if all bits in `other` are set.
    pub const fn contains(self, other: Services) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns true if no bits are set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Not a full node.
    pub const NONE: Services = Services(0x00);

    /// 0x01 NODE_NETWORK: full node, can be asked for full blocks.
    pub const NODE_NETWORK: Services = Services(0x01);

    /// 0x04 NODE_BLOOM: supports bloom-filtered connections (BIP111).
    pub const NODE_BLOOM: Services = Services(0x04);

    /// 0x08 NODE_WITNESS: serves witness data (BIP144).
    pub const NODE_WITNESS: Services = Services(0x08);

    /// 0x0400 NODE_NETWORK_LIMITED: serves the last 288 blocks (BIP159).
    pub const NODE_NETWORK_LIMITED: Services = Services(0x0400);

    pub fn names(self) -> Vec<&'static str> {
        if self.is_empty() {
            return vec!["NONE"];
        }

        [
            (Self::NODE_NETWORK, "NODE_NETWORK"),
            (Self::NODE_BLOOM, "NODE_BLOOM"),
            (Self::NODE_WITNESS, "NODE_WITNESS"),
            (Self::NODE_NETWORK_LIMITED, "NODE_NETWORK_LIMITED"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect()
    }
}

impl From<u64> for Services {
    fn from(value: u64) -> Self {
        Services::new(value)
    }
}

impl std::ops::BitOr for Services {
    type Output = Services;

    fn bitor(self, rhs: Services) -> Services {
        Services(self.0 | rhs.0)
    }
}

impl Debug for Services {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if self.is_empty() {
            return write!(f, "Services(NONE)");
        }

        let names = self.names().join(" | ");

        write!(f, "Services({}) [0x{:016x}]", names, self.bits())
    }
}
