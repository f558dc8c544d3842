//! Ledger codecs.
//!
//! The wire layer never looks inside blocks, headers, transactions or
//! merkle blocks. It hands their bytes to the codecs grouped by a [`Ledger`]
//! and stores whatever they return. [`Bitcoin`] plugs in the consensus
//! encoding of the `bitcoin` crate.

use std::fmt::Debug;

use bitcoin::consensus::encode;

use crate::error::CodecError;

/// Binary codec for one ledger object.
pub trait WireCodec: Sized + Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Decodes a value that spans exactly `bytes`.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    /// Encodes the value into its wire form.
    fn encode(&self) -> Vec<u8>;
}

/// The four codecs a registry needs to build `block`, `headers`, `tx` and
/// `merkleblock` messages.
pub trait Ledger: Debug + Clone + PartialEq + Send + Sync + 'static {
    type Block: WireCodec;
    /// Must encode to exactly [`crate::wire::constants::BLOCK_HEADER_SIZE`] bytes.
    type BlockHeader: WireCodec;
    type Transaction: WireCodec;
    type MerkleBlock: WireCodec;
}

/// Bitcoin consensus codecs from the `bitcoin` crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bitcoin;

impl Ledger for Bitcoin {
    type Block = bitcoin::Block;
    type BlockHeader = bitcoin::block::Header;
    type Transaction = bitcoin::Transaction;
    type MerkleBlock = bitcoin::merkle_tree::MerkleBlock;
}

macro_rules! consensus_codec {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl WireCodec for $ty {
                fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
                    let (value, consumed) = encode::deserialize_partial::<$ty>(bytes)
                        .map_err(|e| CodecError::Decode(e.to_string()))?;
                    if consumed != bytes.len() {
                        return Err(CodecError::TrailingBytes(bytes.len() - consumed));
                    }
                    Ok(value)
                }

                fn encode(&self) -> Vec<u8> {
                    encode::serialize(self)
                }
            }
        )+
    };
}

consensus_codec!(
    bitcoin::Block,
    bitcoin::block::Header,
    bitcoin::Transaction,
    bitcoin::merkle_tree::MerkleBlock,
);

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::Network;

    #[test]
    fn genesis_header_is_80_bytes() {
        let header = genesis_block(Network::Bitcoin).header;
        let bytes = WireCodec::encode(&header);
        assert_eq!(bytes.len(), crate::wire::constants::BLOCK_HEADER_SIZE);
        assert_eq!(<bitcoin::block::Header as WireCodec>::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn genesis_block_survives_codec() {
        let block = genesis_block(Network::Bitcoin);
        let bytes = WireCodec::encode(&block);
        let back = <bitcoin::Block as WireCodec>::decode(&bytes).unwrap();
        assert_eq!(back.block_hash(), block.block_hash());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = WireCodec::encode(&genesis_block(Network::Bitcoin).header);
        bytes.push(0);
        assert_eq!(
            <bitcoin::block::Header as WireCodec>::decode(&bytes),
            Err(CodecError::TrailingBytes(1))
        );
    }

    #[test]
    fn garbage_transaction_fails() {
        let err = <bitcoin::Transaction as WireCodec>::decode(&[0x01, 0x02]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
