//! Error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a ledger codec (block, header, transaction, merkle block).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The bytes could not be decoded.
    #[error("Ledger decode failed: {0}")]
    Decode(String),

    /// The value decoded but did not consume the whole input.
    #[error("Ledger decode left {0} trailing bytes")]
    TrailingBytes(usize),
}

/// Errors raised while constructing a message or decoding its payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// A constructor argument was rejected.
    #[error("{0}")]
    InvalidArgument(String),

    /// A hash was not 32 bytes long.
    #[error("Invalid hash length: expected 32 bytes, got {0}")]
    InvalidHashLength(usize),

    /// A payload ended before a field could be read.
    #[error("Unexpected end of payload while reading {0}")]
    UnexpectedEof(&'static str),

    /// A payload field held an impossible value.
    #[error("Invalid payload data: {0}")]
    InvalidData(String),

    /// A list exceeded its protocol limit.
    #[error("Too many {what}: {count}, max {max}")]
    TooManyEntries {
        what: &'static str,
        count: usize,
        max: usize,
    },

    /// The ledger codec rejected the payload.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors raised by the frame decoder.
///
/// Frames with a foreign magic or a bad checksum are not errors, they are
/// dropped silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The checksum matched but no registry entry exists for the command.
    #[error("Unsupported message command: {0}")]
    UnsupportedCommand(String),

    /// The command is known but its payload did not decode.
    #[error("Invalid {command} payload: {source}")]
    Payload {
        command: &'static str,
        #[source]
        source: MessageError,
    },
}

/// Ping round-trip anomalies reported while handling a `pong`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongProblem {
    #[error("Short payload")]
    ShortPayload,

    #[error("Unsolicited pong without ping")]
    Unsolicited,

    #[error("Timing mishap")]
    TimingMishap,

    #[error("Nonce mismatch")]
    NonceMismatch,

    #[error("Nonce zero")]
    NonceZero,
}

/// Peer errors.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The operation is not allowed in the peer's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// SOCKS5 negotiation failed.
    #[error("Proxy error: {0}")]
    Proxy(#[from] tokio_socks::Error),

    /// The socket did not connect in time.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    /// An inbound frame could not be turned into a message.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// An outbound message could not be built.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// A `pong` did not match the outstanding `ping`.
    #[error(transparent)]
    Pong(#[from] PongProblem),

    /// The receive buffer grew past its cap.
    #[error("Receive buffer overflow: {size} bytes, max {max} bytes")]
    ReceiveBufferOverflow { size: usize, max: usize },

    /// The connection is gone, or never came up. The cause, if any, was
    /// already emitted as an error event.
    #[error("Connection closed")]
    Closed,
}

/// Result type for message construction and payload decoding.
pub type MessageResult<T> = Result<T, MessageError>;

/// Result type for peer operations.
pub type PeerResult<T> = Result<T, PeerError>;
