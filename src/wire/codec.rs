use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::error::FrameError;
use crate::ledger::Ledger;
use crate::network::NetworkParams;
use crate::registry::Registry;
use crate::wire::buffer::ReceiveBuffer;
use crate::wire::constants::{COMMAND_SIZE, HEADER_SIZE};
use crate::wire::message::{Command, Message};

/// Header fields of one frame.
///
/// ```text
/// +------------+--------------+---------------+------------+
/// | magic (4)  | command (12) | length (4 LE) | checksum(4)|
/// +------------+--------------+---------------+------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    pub fn parse(header: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&header[4..16]);
        let mut length = [0u8; 4];
        length.copy_from_slice(&header[16..20]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&header[20..24]);

        Self {
            magic,
            command,
            length: u32::from_le_bytes(length),
            checksum,
        }
    }

    /// The command field with its NUL padding removed.
    ///
    /// `None` unless the field is printable ASCII followed only by NULs.
    pub fn command_name(&self) -> Option<&str> {
        let end = self
            .command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(COMMAND_SIZE);
        let (name, padding) = self.command.split_at(end);
        if padding.iter().any(|b| *b != 0) || !name.iter().all(u8::is_ascii_graphic) {
            return None;
        }
        std::str::from_utf8(name).ok()
    }

    /// Header plus payload.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}

/// Outcome of one [`decode_one`] step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<L: Ledger> {
    /// A complete, valid frame was consumed.
    Message(Message<L>),
    /// The buffer does not hold a full frame yet. Nothing was consumed.
    NeedMoreData,
    /// Malformed bytes (foreign magic or bad checksum) were discarded.
    Dropped,
}

/// First 4 bytes of `SHA256(SHA256(payload))`.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

/// Writes a complete Bitcoin P2P message frame to the given writer.
///
/// ```text
/// +------------+--------------+---------------+------------+
/// | magic (4)  | command (12) | length (4 LE) | checksum(4)|
/// +------------+--------------+---------------+------------+
/// | payload (variable)                                ...  |
/// +----------------------------------------------------------
/// ```
///
/// # Errors
///
/// Returns an error if writing to the underlying stream fails.
pub fn write_frame<W: Write>(
    writer: &mut W,
    magic: [u8; 4],
    command: Command,
    payload: &[u8],
) -> io::Result<()> {
    writer.write_all(&magic)?;
    writer.write_all(&command.as_bytes())?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_all(&checksum(payload))?;
    writer.write_all(payload)?;
    Ok(())
}

/// Serializes `message` into a full frame for `network`.
pub fn encode<L: Ledger>(message: &Message<L>, network: &NetworkParams) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    // Writing into a Vec cannot fail.
    let _ = write_frame(&mut out, network.magic(), message.command(), &payload);
    out
}

/// Tries to take one frame off the front of `buffer`.
///
/// Frames whose magic does not match `network` are skipped by discarding
/// bytes up to the next occurrence of the magic. Frames with a bad checksum
/// are consumed and dropped, as are frames whose command field is not
/// NUL-padded printable ASCII. A valid frame carrying a command the registry
/// does not know is consumed and reported as
/// [`FrameError::UnsupportedCommand`].
pub fn decode_one<L: Ledger>(
    buffer: &mut ReceiveBuffer,
    network: &NetworkParams,
    registry: &Registry<L>,
) -> Result<Decoded<L>, FrameError> {
    let Some(bytes) = buffer.peek(HEADER_SIZE) else {
        return Ok(Decoded::NeedMoreData);
    };
    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(bytes);
    let header = FrameHeader::parse(&raw);

    let magic = network.magic();
    if header.magic != magic {
        let skip = resync_offset(buffer.as_slice(), &magic);
        debug!(
            network = %network,
            found = %hex::encode(header.magic),
            skipped = skip,
            "Dropping bytes with foreign magic"
        );
        buffer.consume(skip);
        return Ok(Decoded::Dropped);
    }

    let frame_len = header.frame_len();
    if buffer.len() < frame_len {
        return Ok(Decoded::NeedMoreData);
    }

    let payload = &buffer.as_slice()[HEADER_SIZE..frame_len];
    if checksum(payload) != header.checksum {
        debug!(
            command = %hex::encode(header.command),
            length = header.length,
            "Dropping frame with bad checksum"
        );
        buffer.consume(frame_len);
        return Ok(Decoded::Dropped);
    }

    let Some(name) = header.command_name() else {
        debug!(
            command = %hex::encode(header.command),
            "Dropping frame with malformed command"
        );
        buffer.consume(frame_len);
        return Ok(Decoded::Dropped);
    };
    let result = match registry.command(name) {
        Some(command) => registry
            .from_buffer(command, payload)
            .map(Decoded::Message)
            .map_err(|source| FrameError::Payload {
                command: command.name(),
                source,
            }),
        None => Err(FrameError::UnsupportedCommand(name.to_string())),
    };
    buffer.consume(frame_len);

    if let Ok(Decoded::Message(message)) = &result {
        trace!(command = %message.command(), length = header.length, "Decoded frame");
    }
    result
}

/// Decodes every complete frame in `buffer`, in stream order.
///
/// Dropped frames are skipped. The first [`FrameError`] is returned; the
/// offending frame is already consumed, so calling again resumes after it.
pub fn decode_all<L: Ledger>(
    buffer: &mut ReceiveBuffer,
    network: &NetworkParams,
    registry: &Registry<L>,
) -> Result<Vec<Message<L>>, FrameError> {
    let mut messages = Vec::new();
    loop {
        match decode_one(buffer, network, registry)? {
            Decoded::Message(message) => messages.push(message),
            Decoded::Dropped => continue,
            Decoded::NeedMoreData => return Ok(messages),
        }
    }
}

/// How many leading bytes to discard so the buffer starts at the next
/// candidate magic. Keeps a trailing partial match.
fn resync_offset(bytes: &[u8], magic: &[u8; 4]) -> usize {
    if let Some(pos) = bytes
        .windows(magic.len())
        .skip(1)
        .position(|w| w == magic)
    {
        return pos + 1;
    }
    let mut keep = magic.len() - 1;
    while keep > 0 {
        if bytes.ends_with(&magic[..keep]) {
            break;
        }
        keep -= 1;
    }
    bytes.len().saturating_sub(keep).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessageError;
    use crate::ledger::Bitcoin;
    use crate::wire::inventory::InventoryItem;
    use crate::wire::message::Ping;

    fn registry() -> Registry<Bitcoin> {
        Registry::builder().build()
    }

    fn mainnet() -> NetworkParams {
        NetworkParams::mainnet()
    }

    /// Builds a full Bitcoin message frame (header + payload) with a valid checksum.
    fn build_frame(cmd_str: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&[0xF9, 0xBE, 0xB4, 0xD9]);
        let mut cmd = [0u8; 12];
        cmd[..cmd_str.len()].copy_from_slice(cmd_str);
        bytes.extend_from_slice(&cmd);
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&checksum(payload));
        bytes.extend_from_slice(payload);
        bytes
    }

    fn buffer_from_hex(s: &str) -> ReceiveBuffer {
        ReceiveBuffer::from(&hex::decode(s).unwrap()[..])
    }

    #[test]
    fn verack_frame_layout() {
        let frame = encode(&Message::<Bitcoin>::VerAck, &mainnet());
        assert_eq!(
            hex::encode(&frame),
            "f9beb4d976657261636b000000000000000000005df6e0e2"
        );
    }

    #[test]
    fn frame_magic_follows_network() {
        let frame = encode(&Message::<Bitcoin>::GetAddr, &NetworkParams::testnet());
        assert_eq!(&frame[..4], &[0x0B, 0x11, 0x09, 0x07]);
    }

    #[test]
    fn header_parse_reads_fields() {
        let frame = build_frame(b"ping", &[1, 2, 3, 4, 5, 6, 7, 8]);
        let header = FrameHeader::parse(frame[..24].try_into().unwrap());
        assert_eq!(header.command_name(), Some("ping"));
        assert_eq!(header.length, 8);
        assert_eq!(header.frame_len(), 32);
    }

    #[test]
    fn decode_one_waits_for_header_and_payload() {
        let frame = encode(&Message::<Bitcoin>::Ping(Ping::new()), &mainnet());
        for cut in [0, 10, 23, 24, frame.len() - 1] {
            let mut buf = ReceiveBuffer::from(&frame[..cut]);
            assert_eq!(
                decode_one(&mut buf, &mainnet(), &registry()).unwrap(),
                Decoded::NeedMoreData
            );
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn every_variant_round_trips_through_a_frame() {
        let reg = registry();
        let messages = vec![
            reg.version(),
            reg.verack(),
            reg.ping(),
            reg.inventory().for_block(&[3u8; 32]).unwrap(),
            reg.get_data().for_transaction(&[4u8; 32]).unwrap(),
            reg.get_addr(),
            reg.mempool(),
            reg.filter_clear(),
        ];
        let mut buf = ReceiveBuffer::new();
        for m in &messages {
            buf.extend(&reg.encode(m));
        }
        assert_eq!(decode_all(&mut buf, &mainnet(), &reg).unwrap(), messages);
        assert!(buf.is_empty());
    }

    #[test]
    fn malicious_command_is_unsupported() {
        let mut buf = buffer_from_hex(
            "f9beb4d96d616c6963696f757300000025000000bd5e830c0102000000ec3995c1bf7269ff728818a65e53af00cbbee6b6eca8ac9ce7bc79d877041ed8",
        );
        let err = decode_one(&mut buf, &mainnet(), &registry()).unwrap_err();
        assert_eq!(err, FrameError::UnsupportedCommand("malicious".into()));
        assert_eq!(err.to_string(), "Unsupported message command: malicious");
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_frames_yield_nothing() {
        let vectors = [
            // foreign magic
            "d8c4c3d976657273696f6e000000000065000000fc970f17721101000100000000000000ba62885400000000010000000000000000000000000000000000ffffba8886dceab0010000000000000000000000000000000000ffff05095522208de7e1c1ef80a1cea70f2f5361746f7368693a302e392e312fa317050001",
            // declared length longer than the data
            "f9beb4d967657464617461000000000089000000d881347401020000006308e4a380c949dbad182747b0f7b6a89e874328ca41f37287f74a81b8f8486d",
            // bad checksum
            "f9beb4d96765746461746100000000002500000061626364010200000069ebcbc34a4f9890da9aea0f773beba883a9afb1ab9ad7647dd4a1cd346c3728",
        ];
        for v in vectors {
            let mut buf = buffer_from_hex(v);
            let messages = decode_all(&mut buf, &mainnet(), &registry()).unwrap();
            assert!(messages.is_empty(), "{v}");
        }
    }

    #[test]
    fn malformed_command_field_is_dropped() {
        let reg = registry();
        for name in [&b"verack\0junk"[..], &b"ver\xFFack"[..]] {
            let mut buf = ReceiveBuffer::from(&build_frame(name, &[])[..]);
            buf.extend(&build_frame(b"verack", &[]));
            assert_eq!(decode_one(&mut buf, &mainnet(), &reg).unwrap(), Decoded::Dropped);
            assert_eq!(
                decode_one(&mut buf, &mainnet(), &reg).unwrap(),
                Decoded::Message(Message::VerAck)
            );
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn bad_checksum_consumes_frame() {
        let mut frame = build_frame(b"verack", &[]);
        frame[20] ^= 0xFF;
        let good = build_frame(b"verack", &[]);
        let mut buf = ReceiveBuffer::from(&frame[..]);
        buf.extend(&good);

        let reg = registry();
        assert_eq!(decode_one(&mut buf, &mainnet(), &reg).unwrap(), Decoded::Dropped);
        assert_eq!(buf.len(), good.len());
        assert_eq!(
            decode_one(&mut buf, &mainnet(), &reg).unwrap(),
            Decoded::Message(Message::VerAck)
        );
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let mut bytes = vec![0x00, 0xF9, 0x13, 0x37, 0xAA];
        bytes.extend(build_frame(b"getaddr", &[]));
        let mut buf = ReceiveBuffer::from(&bytes[..]);

        let messages = decode_all(&mut buf, &mainnet(), &registry()).unwrap();
        assert_eq!(messages, vec![Message::GetAddr]);
    }

    #[test]
    fn resync_keeps_partial_magic_suffix() {
        let magic = [0xF9, 0xBE, 0xB4, 0xD9];
        assert_eq!(resync_offset(&[0u8; 30], &magic), 30);
        let mut bytes = vec![0u8; 28];
        bytes.extend([0xF9, 0xBE]);
        assert_eq!(resync_offset(&bytes, &magic), 28);
        let mut bytes = vec![1u8; 10];
        bytes.extend(magic);
        bytes.extend([0u8; 20]);
        assert_eq!(resync_offset(&bytes, &magic), 10);
    }

    #[test]
    fn payload_errors_name_the_command() {
        let mut buf = ReceiveBuffer::from(&build_frame(b"inv", &[0x02, 0x01])[..]);
        let err = decode_one(&mut buf, &mainnet(), &registry()).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Payload {
                command: "inv",
                source: MessageError::UnexpectedEof(_)
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn inventory_frame_hashes_stay_internal_order() {
        let reg = registry();
        let hash = "eb951630aba498b9a0d10f72b5ea9e39d5ff04b03dc2231e662f52057f948aa1";
        let frame = reg.encode(&reg.inventory().for_transaction(hash).unwrap());
        let mut internal = hex::decode(hash).unwrap();
        internal.reverse();
        // header, varint count, type
        assert_eq!(&frame[24 + 1 + 4..], &internal[..]);

        let mut buf = ReceiveBuffer::from(&frame[..]);
        let Decoded::Message(Message::Inventory(items)) =
            decode_one(&mut buf, &mainnet(), &reg).unwrap()
        else {
            panic!("expected Message::Inventory");
        };
        assert_eq!(items, vec![InventoryItem::for_transaction(hash).unwrap()]);
        assert_eq!(items[0].hash.to_string(), hash);
    }
}
