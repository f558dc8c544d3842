use std::time::Duration;

/// Protocol version advertised in `version` and used as the default
/// locator version in `getblocks`/`getheaders`.
///
/// It is serialized on the wire as a signed 32-bit little-endian integer.
///
/// You can find a list of notable versions here:
/// https://developer.bitcoin.org/reference/p2p_networking.html#protocol-versions
pub const PROTOCOL_VERSION: i32 = 70000;

/// First protocol version whose `ping` carries a nonce and expects a `pong`.
///
/// https://github.com/bitcoin/bips/blob/master/bip-0031.mediawiki
pub const BIP0031_VERSION: i32 = 60000;

/// Size of the frame header: magic (4), command (12), length (4), checksum (4).
pub const HEADER_SIZE: usize = 24;

/// Width of the NUL-padded command field.
pub const COMMAND_SIZE: usize = 12;

/// Size of a serialized block header inside a `headers` payload.
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Default cap on buffered, not yet decoded inbound bytes.
pub const MAX_RECEIVE_BUFFER: usize = 10_000_000;

/// Keepalive ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Maximum inventory items in one `inv`/`getdata`/`notfound`.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum entries in one `addr`.
pub const MAX_ADDR_ENTRIES: usize = 1_000;

/// Maximum headers in one `headers`.
pub const MAX_HEADERS: usize = 2_000;
