//! Per-network constants.
//!
//! The first 4 bytes of every P2P frame identify the network and act as a
//! message boundary marker in the TCP stream. Bitcoin Core maps magic values
//! to networks in `GetNetworkForMagic`:
//! https://github.com/bitcoin/bitcoin/blob/master/src/kernel/chainparams.cpp

use std::fmt;

/// Network parameters consumed by the frame codec and the peer.
///
/// Presets cover the public Bitcoin networks. Other chains sharing the wire
/// format can be described with [`NetworkParams::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkParams {
    name: String,
    magic: [u8; 4],
    default_port: u16,
}

impl NetworkParams {
    /// Builds custom parameters. `magic` is given in wire order.
    pub fn new(name: impl Into<String>, magic: [u8; 4], default_port: u16) -> Self {
        Self {
            name: name.into(),
            magic,
            default_port,
        }
    }

    /// Mainnet, magic `F9 BE B4 D9`.
    pub fn mainnet() -> Self {
        Self::new("livenet", [0xF9, 0xBE, 0xB4, 0xD9], 8333)
    }

    /// Testnet3, magic `0B 11 09 07`.
    pub fn testnet() -> Self {
        Self::new("testnet", [0x0B, 0x11, 0x09, 0x07], 18333)
    }

    /// Regtest, magic `FA BF B5 DA`.
    pub fn regtest() -> Self {
        Self::new("regtest", [0xFA, 0xBF, 0xB5, 0xDA], 18444)
    }

    /// Default signet, magic `0A 03 CF 40`.
    pub fn signet() -> Self {
        Self::new("signet", [0x0A, 0x03, 0xCF, 0x40], 38333)
    }

    /// Looks up a preset by name. `mainnet` is accepted as an alias of `livenet`.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "livenet" | "mainnet" => Some(Self::mainnet()),
            "testnet" => Some(Self::testnet()),
            "regtest" => Some(Self::regtest()),
            "signet" => Some(Self::signet()),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    pub fn default_port(&self) -> u16 {
        self.default_port
    }
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl fmt::Display for NetworkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
