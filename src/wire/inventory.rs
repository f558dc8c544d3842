//! Inventory vectors and 32-byte hashes.
//!
//! Hashes are kept in internal (little-endian) byte order, the order they
//! travel in on the wire. Block explorers and RPC display them reversed, so
//! hex strings given to the constructors here are read in display order.

use std::fmt;
use std::str::FromStr;

use crate::error::{MessageError, MessageResult};
use crate::wire::decode::{read_hash, read_u32};

/// A 32-byte hash in internal byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Wraps bytes already in internal order.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Wraps a slice in internal order, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> MessageResult<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MessageError::InvalidHashLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// Parses a display-order hex string and reverses it into internal order.
    pub fn from_hex(display: &str) -> MessageResult<Self> {
        let mut bytes = hex::decode(display)
            .map_err(|e| MessageError::InvalidArgument(format!("Invalid hex hash: {e}")))?;
        bytes.reverse();
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Display-order hex.
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<bitcoin::BlockHash> for Hash256 {
    fn from(hash: bitcoin::BlockHash) -> Self {
        use bitcoin::hashes::Hash;
        Self(hash.to_byte_array())
    }
}

impl From<bitcoin::Txid> for Hash256 {
    fn from(hash: bitcoin::Txid) -> Self {
        use bitcoin::hashes::Hash;
        Self(hash.to_byte_array())
    }
}

/// Anything that names a 32-byte hash.
///
/// Strings are display-order hex; byte slices and arrays are internal order.
pub trait AsHash {
    fn to_hash(&self) -> MessageResult<Hash256>;
}

impl AsHash for Hash256 {
    fn to_hash(&self) -> MessageResult<Hash256> {
        Ok(*self)
    }
}

impl AsHash for str {
    fn to_hash(&self) -> MessageResult<Hash256> {
        Hash256::from_hex(self)
    }
}

impl AsHash for String {
    fn to_hash(&self) -> MessageResult<Hash256> {
        Hash256::from_hex(self)
    }
}

impl AsHash for [u8] {
    fn to_hash(&self) -> MessageResult<Hash256> {
        Hash256::from_slice(self)
    }
}

impl AsHash for Vec<u8> {
    fn to_hash(&self) -> MessageResult<Hash256> {
        Hash256::from_slice(self)
    }
}

impl AsHash for [u8; 32] {
    fn to_hash(&self) -> MessageResult<Hash256> {
        Ok(Hash256(*self))
    }
}

impl<T: AsHash + ?Sized> AsHash for &T {
    fn to_hash(&self) -> MessageResult<Hash256> {
        (**self).to_hash()
    }
}

/// Inventory object types used in `inv`, `getdata`, and `notfound` messages.
///
/// Defined by the Bitcoin P2P protocol:
/// https://developer.bitcoin.org/reference/p2p_networking.html#data-messages
///
/// These values are serialized as little-endian 32-bit unsigned integers.
/// Values this crate does not name survive a round trip through [`InventoryType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryType {
    /// Error / undefined type.
    Error,

    /// Transaction (legacy txid-based).
    Tx,

    /// Full block.
    Block,

    /// Filtered block (BIP37), answered with `merkleblock`.
    FilteredBlock,

    /// Compact block (BIP152).
    CompactBlock,

    /// Witness transaction (BIP144).
    WitnessTx,

    /// Witness block (BIP144).
    WitnessBlock,

    /// Witness filtered block (BIP144).
    WitnessFilteredBlock,

    Other(u32),
}

impl InventoryType {
    /// Alias of [`InventoryType::FilteredBlock`].
    pub const MERKLE_BLOCK: InventoryType = InventoryType::FilteredBlock;

    pub fn as_u32(self) -> u32 {
        match self {
            InventoryType::Error => 0,
            InventoryType::Tx => 1,
            InventoryType::Block => 2,
            InventoryType::FilteredBlock => 3,
            InventoryType::CompactBlock => 4,
            InventoryType::WitnessTx => 0x4000_0001,
            InventoryType::WitnessBlock => 0x4000_0002,
            InventoryType::WitnessFilteredBlock => 0x4000_0003,
            InventoryType::Other(v) => v,
        }
    }

    /// Serialize the inventory type to little-endian bytes for wire usage.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.as_u32().to_le_bytes()
    }
}

impl From<u32> for InventoryType {
    fn from(value: u32) -> Self {
        match value {
            0 => InventoryType::Error,
            1 => InventoryType::Tx,
            2 => InventoryType::Block,
            3 => InventoryType::FilteredBlock,
            4 => InventoryType::CompactBlock,
            0x4000_0001 => InventoryType::WitnessTx,
            0x4000_0002 => InventoryType::WitnessBlock,
            0x4000_0003 => InventoryType::WitnessFilteredBlock,
            v => InventoryType::Other(v),
        }
    }
}

/// One `(type, hash)` inventory record, 36 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub kind: InventoryType,
    pub hash: Hash256,
}

impl InventoryItem {
    /// Size of one record on the wire.
    pub const SIZE: usize = 36;

    pub fn new<H: AsHash + ?Sized>(kind: InventoryType, hash: &H) -> MessageResult<Self> {
        Ok(Self {
            kind,
            hash: hash.to_hash()?,
        })
    }

    pub fn for_transaction<H: AsHash + ?Sized>(hash: &H) -> MessageResult<Self> {
        Self::new(InventoryType::Tx, hash)
    }

    pub fn for_block<H: AsHash + ?Sized>(hash: &H) -> MessageResult<Self> {
        Self::new(InventoryType::Block, hash)
    }

    pub fn for_filtered_block<H: AsHash + ?Sized>(hash: &H) -> MessageResult<Self> {
        Self::new(InventoryType::FilteredBlock, hash)
    }

    pub fn for_merkle_block<H: AsHash + ?Sized>(hash: &H) -> MessageResult<Self> {
        Self::new(InventoryType::MERKLE_BLOCK, hash)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(self.hash.as_bytes());
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..].copy_from_slice(self.hash.as_bytes());
        out
    }

    pub(crate) fn read_from(p: &[u8], c: &mut usize) -> MessageResult<Self> {
        let kind = InventoryType::from(read_u32(p, c)?);
        let hash = read_hash(p, c, "inventory: hash")?;
        Ok(Self { kind, hash })
    }

    /// Parses exactly one 36-byte record.
    pub fn from_bytes(bytes: &[u8]) -> MessageResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(MessageError::InvalidArgument(format!(
                "Inventory item must be {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut c = 0;
        Self::read_from(bytes, &mut c)
    }
}
