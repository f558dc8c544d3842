//! Payload serialization.
//!
//! Layouts follow the Bitcoin P2P reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};

use crate::ledger::{Ledger, WireCodec};
use crate::wire::inventory::InventoryItem;
use crate::wire::message::{
    AddrEntry, Alert, BlockLocator, Encode, FilterAdd, NetAddr, Ping, Pong, Reject, Version,
};

// Writes into a Vec<u8> cannot fail, so the byteorder results are discarded.

impl Encode for Version {
    /// ```text
    /// int32    version
    /// uint64   services
    /// int64    timestamp
    /// net_addr addr_recv
    /// net_addr addr_from
    /// uint64   nonce
    /// var_str  subversion
    /// int32    start_height
    /// bool     relay
    /// ```
    fn encode(&self, out: &mut Vec<u8>) {
        let _ = out.write_i32::<LittleEndian>(self.version);
        let _ = out.write_u64::<LittleEndian>(self.services.bits());
        let _ = out.write_i64::<LittleEndian>(self.timestamp);
        write_net_addr(&self.addr_recv, out);
        write_net_addr(&self.addr_from, out);
        let _ = out.write_u64::<LittleEndian>(self.nonce);
        write_var_str(&self.subversion, out);
        let _ = out.write_i32::<LittleEndian>(self.start_height);
        out.push(u8::from(self.relay));
    }
}

impl Encode for Ping {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce);
    }
}

impl Encode for Pong {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce);
    }
}

impl Encode for Vec<AddrEntry> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(self.len() as u64, out);
        for entry in self {
            let _ = out.write_u32::<LittleEndian>(entry.timestamp);
            write_net_addr(&entry.addr, out);
        }
    }
}

impl Encode for Vec<InventoryItem> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_varint(self.len() as u64, out);
        for item in self {
            item.write_to(out);
        }
    }
}

impl Encode for BlockLocator {
    /// ```text
    /// uint32  protocol_version
    /// varint  hash_count
    /// hash[]  block_locator_hashes
    /// hash    hash_stop
    /// ```
    fn encode(&self, out: &mut Vec<u8>) {
        let _ = out.write_u32::<LittleEndian>(self.version);
        write_varint(self.starts.len() as u64, out);
        for hash in &self.starts {
            out.extend_from_slice(hash.as_bytes());
        }
        out.extend_from_slice(self.stop.as_bytes());
    }
}

impl Encode for FilterAdd {
    fn encode(&self, out: &mut Vec<u8>) {
        write_var_bytes(&self.data, out);
    }
}

impl Encode for Alert {
    fn encode(&self, out: &mut Vec<u8>) {
        write_var_bytes(&self.payload, out);
        write_var_bytes(&self.signature, out);
    }
}

impl Encode for Reject {
    /// ```text
    /// var_str message
    /// uint8   ccode
    /// var_str reason
    /// bytes   data     (rest of payload)
    /// ```
    fn encode(&self, out: &mut Vec<u8>) {
        write_var_str(&self.message, out);
        out.push(self.code.0);
        write_var_str(&self.reason, out);
        out.extend_from_slice(&self.data);
    }
}

/// Each header is followed by a CompactSize transaction count, always zero
/// in a `headers` message.
pub(crate) fn write_headers<L: Ledger>(headers: &[L::BlockHeader], out: &mut Vec<u8>) {
    write_varint(headers.len() as u64, out);
    for header in headers {
        out.extend(WireCodec::encode(header));
        write_varint(0, out);
    }
}

/// services (u64 LE), 16-byte IPv6 / IPv4-mapped address, port (u16 BE).
pub(crate) fn write_net_addr(addr: &NetAddr, out: &mut Vec<u8>) {
    let _ = out.write_u64::<LittleEndian>(addr.services.bits());
    out.extend_from_slice(&addr.ip_bytes());
    let _ = out.write_u16::<BigEndian>(addr.port);
}

pub(crate) fn write_var_str(s: &str, out: &mut Vec<u8>) {
    write_var_bytes(s.as_bytes(), out);
}

pub(crate) fn write_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_varint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

pub(crate) fn write_varint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend(&value.to_le_bytes());
        }
    }
}
