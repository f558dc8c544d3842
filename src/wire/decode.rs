use crate::bloom::BloomFilter;
use crate::error::{MessageError, MessageResult};
use crate::ledger::{Ledger, WireCodec};
use crate::wire::constants::{BLOCK_HEADER_SIZE, MAX_ADDR_ENTRIES, MAX_HEADERS, MAX_INV_ENTRIES};
use crate::wire::inventory::{Hash256, InventoryItem};
use crate::wire::message::{
    AddrEntry, Alert, BlockLocator, Command, Decode, FilterAdd, Message, NetAddr, Ping, Pong,
    Reject, RejectCode, Services, Version,
};

/// Largest locator Bitcoin Core accepts in `getblocks`/`getheaders`.
const MAX_LOCATOR_HASHES: usize = 101;

pub(crate) fn decode_message<L: Ledger>(command: Command, p: &[u8]) -> MessageResult<Message<L>> {
    Ok(match command {
        Command::Version => Message::Version(Version::decode(p)?),
        Command::VerAck => Message::VerAck,
        Command::Ping => Message::Ping(Ping::decode(p)?),
        Command::Pong => Message::Pong(Pong::decode(p)?),
        Command::Addr => Message::Addr(Vec::<AddrEntry>::decode(p)?),
        Command::Inv => Message::Inventory(Vec::<InventoryItem>::decode(p)?),
        Command::GetData => Message::GetData(Vec::<InventoryItem>::decode(p)?),
        Command::NotFound => Message::NotFound(Vec::<InventoryItem>::decode(p)?),
        Command::GetBlocks => Message::GetBlocks(BlockLocator::decode(p)?),
        Command::GetHeaders => Message::GetHeaders(BlockLocator::decode(p)?),
        Command::Headers => Message::Headers(decode_headers::<L>(p)?),
        Command::Tx => Message::Tx(decode_optional(p)?),
        Command::Block => Message::Block(decode_optional(p)?),
        Command::MerkleBlock => Message::MerkleBlock(decode_optional(p)?),
        Command::FilterLoad => Message::FilterLoad(Option::<BloomFilter>::decode(p)?),
        Command::FilterAdd => Message::FilterAdd(FilterAdd::decode(p)?),
        Command::FilterClear => Message::FilterClear,
        Command::Mempool => Message::Mempool,
        Command::GetAddr => Message::GetAddr,
        Command::Alert => Message::Alert(Alert::decode(p)?),
        Command::Reject => Message::Reject(Option::<Reject>::decode(p)?),
    })
}

impl Decode for Version {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        let mut c = 0;

        let version = read_i32(payload, &mut c)?;
        let services = Services::from(read_u64(payload, &mut c)?);
        let timestamp = read_i64(payload, &mut c)?;
        let addr_recv = decode_net_addr(payload, &mut c)?;
        let addr_from = decode_net_addr(payload, &mut c)?;
        let nonce = read_u64(payload, &mut c)?;
        let subversion = read_var_str(payload, &mut c, "version: subversion")?;
        let start_height = read_i32(payload, &mut c)?;

        // BIP37 peers append a relay flag; older ones stop here.
        let relay = match payload.get(c) {
            Some(&b) => {
                c += 1;
                b != 0
            }
            None => true,
        };
        check_finished(payload, c, "version")?;

        Ok(Version {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            subversion,
            start_height,
            relay,
        })
    }
}

fn decode_nonce(payload: &[u8], ctx: &'static str) -> MessageResult<Vec<u8>> {
    // A short nonce is kept so the peer can report it; extra bytes are not.
    check_finished(payload, payload.len().min(8), ctx)?;
    Ok(payload.to_vec())
}

impl Decode for Ping {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        Ok(Ping {
            nonce: decode_nonce(payload, "ping")?,
        })
    }
}

impl Decode for Pong {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        Ok(Pong {
            nonce: decode_nonce(payload, "pong")?,
        })
    }
}

impl Decode for Vec<AddrEntry> {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        let mut c = 0;
        let count = read_count(payload, &mut c, "addresses", MAX_ADDR_ENTRIES)?;
        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            let timestamp = read_u32(payload, &mut c)?;
            let addr = decode_net_addr(payload, &mut c)?;
            entries.push(AddrEntry { timestamp, addr });
        }

        check_finished(payload, c, "addr")?;
        Ok(entries)
    }
}

impl Decode for Vec<InventoryItem> {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        let mut c = 0;
        let count = read_count(payload, &mut c, "inventory items", MAX_INV_ENTRIES)?;
        let mut items = Vec::with_capacity(count.min(payload.len() / InventoryItem::SIZE));

        for _ in 0..count {
            items.push(InventoryItem::read_from(payload, &mut c)?);
        }

        check_finished(payload, c, "inventory")?;
        Ok(items)
    }
}

impl Decode for BlockLocator {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        let mut c = 0;
        let version = read_u32(payload, &mut c)?;
        let count = read_count(payload, &mut c, "locator hashes", MAX_LOCATOR_HASHES)?;
        let mut starts = Vec::with_capacity(count);

        for _ in 0..count {
            starts.push(read_hash(payload, &mut c, "locator: start")?);
        }
        let stop = read_hash(payload, &mut c, "locator: stop")?;

        check_finished(payload, c, "locator")?;
        Ok(BlockLocator {
            version,
            starts,
            stop,
        })
    }
}

impl Decode for Option<BloomFilter> {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        if payload.is_empty() {
            return Ok(None);
        }
        let mut c = 0;
        let filter = BloomFilter::read_from(payload, &mut c)?;
        check_finished(payload, c, "filterload")?;
        Ok(Some(filter))
    }
}

impl Decode for FilterAdd {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        let mut c = 0;
        let data = read_var_bytes(payload, &mut c, "filteradd: data")?;
        check_finished(payload, c, "filteradd")?;
        FilterAdd::new(data)
    }
}

impl Decode for Alert {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        let mut c = 0;
        let body = read_var_bytes(payload, &mut c, "alert: payload")?;
        let signature = read_var_bytes(payload, &mut c, "alert: signature")?;
        check_finished(payload, c, "alert")?;
        Ok(Alert {
            payload: body,
            signature,
        })
    }
}

impl Decode for Option<Reject> {
    fn decode(payload: &[u8]) -> MessageResult<Self> {
        if payload.is_empty() {
            return Ok(None);
        }
        let mut c = 0;
        let message = read_var_str(payload, &mut c, "reject: message")?;
        let code = RejectCode(read_u8(payload, &mut c, "reject: ccode")?);
        let reason = read_var_str(payload, &mut c, "reject: reason")?;
        let data = payload[c..].to_vec();
        Ok(Some(Reject {
            message,
            code,
            reason,
            data,
        }))
    }
}

fn decode_headers<L: Ledger>(payload: &[u8]) -> MessageResult<Vec<L::BlockHeader>> {
    let mut c = 0;
    let count = read_count(payload, &mut c, "headers", MAX_HEADERS)?;
    let mut headers = Vec::with_capacity(count);

    for _ in 0..count {
        let raw = read_bytes(payload, &mut c, BLOCK_HEADER_SIZE, "headers: header")?;
        headers.push(<L::BlockHeader as WireCodec>::decode(raw)?);

        // txn_count (always 0 in headers message)
        let _ = read_varint(payload, &mut c)?;
    }

    check_finished(payload, c, "headers")?;
    Ok(headers)
}

fn decode_optional<T: WireCodec>(payload: &[u8]) -> MessageResult<Option<T>> {
    if payload.is_empty() {
        return Ok(None);
    }
    Ok(Some(<T as WireCodec>::decode(payload)?))
}

fn decode_net_addr(p: &[u8], c: &mut usize) -> MessageResult<NetAddr> {
    let services = Services::from(read_u64(p, c)?);
    let ip: [u8; 16] = read_array(p, c, "net_addr: ip")?;
    let port = u16::from_be_bytes(read_array(p, c, "net_addr: port")?);
    Ok(NetAddr::from_ip_bytes(services, ip, port))
}

fn eof(context: &'static str) -> MessageError {
    MessageError::UnexpectedEof(context)
}

pub(crate) fn check_finished(p: &[u8], c: usize, ctx: &'static str) -> MessageResult<()> {
    if c < p.len() {
        return Err(MessageError::InvalidData(format!(
            "{ctx}: {} bytes still available after parsing",
            p.len() - c
        )));
    }
    Ok(())
}

pub(crate) fn read_varint(p: &[u8], c: &mut usize) -> MessageResult<u64> {
    let first = read_u8(p, c, "varint")?;
    match first {
        0xFD => Ok(u16::from_le_bytes(read_array(p, c, "varint:fd")?) as u64),
        0xFE => Ok(u32::from_le_bytes(read_array(p, c, "varint:fe")?) as u64),
        0xFF => Ok(u64::from_le_bytes(read_array(p, c, "varint:ff")?)),
        n => Ok(n as u64),
    }
}

/// Reads a list length and rejects it above `max`.
fn read_count(p: &[u8], c: &mut usize, what: &'static str, max: usize) -> MessageResult<usize> {
    let count = read_varint(p, c)?;
    if count > max as u64 {
        return Err(MessageError::TooManyEntries {
            what,
            count: usize::try_from(count).unwrap_or(usize::MAX),
            max,
        });
    }
    Ok(count as usize)
}

pub(crate) fn read_u8(p: &[u8], c: &mut usize, ctx: &'static str) -> MessageResult<u8> {
    let b = *p.get(*c).ok_or_else(|| eof(ctx))?;
    *c += 1;
    Ok(b)
}

fn read_i32(p: &[u8], c: &mut usize) -> MessageResult<i32> {
    Ok(i32::from_le_bytes(read_array(p, c, "i32")?))
}
fn read_i64(p: &[u8], c: &mut usize) -> MessageResult<i64> {
    Ok(i64::from_le_bytes(read_array(p, c, "i64")?))
}
pub(crate) fn read_u32(p: &[u8], c: &mut usize) -> MessageResult<u32> {
    Ok(u32::from_le_bytes(read_array(p, c, "u32")?))
}
fn read_u64(p: &[u8], c: &mut usize) -> MessageResult<u64> {
    Ok(u64::from_le_bytes(read_array(p, c, "u64")?))
}

pub(crate) fn read_hash(p: &[u8], c: &mut usize, ctx: &'static str) -> MessageResult<Hash256> {
    Ok(Hash256::from_bytes(read_array(p, c, ctx)?))
}

fn read_bytes<'a>(
    p: &'a [u8],
    c: &mut usize,
    n: usize,
    ctx: &'static str,
) -> MessageResult<&'a [u8]> {
    let end = c.checked_add(n).ok_or_else(|| eof(ctx))?;
    let b = p.get(*c..end).ok_or_else(|| eof(ctx))?;
    *c = end;
    Ok(b)
}

fn read_array<const N: usize>(p: &[u8], c: &mut usize, ctx: &'static str) -> MessageResult<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(read_bytes(p, c, N, ctx)?);
    Ok(out)
}

pub(crate) fn read_var_bytes(p: &[u8], c: &mut usize, ctx: &'static str) -> MessageResult<Vec<u8>> {
    let len = usize::try_from(read_varint(p, c)?).map_err(|_| eof(ctx))?;
    Ok(read_bytes(p, c, len, ctx)?.to_vec())
}

fn read_var_str(p: &[u8], c: &mut usize, ctx: &'static str) -> MessageResult<String> {
    let bytes = read_var_bytes(p, c, ctx)?;
    String::from_utf8(bytes).map_err(|e| MessageError::InvalidData(format!("{ctx}: {e}")))
}
