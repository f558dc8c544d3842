//! Bitcoin P2P wire protocol.
//!
//! - [`codec`]: frame layout, checksums and the incremental frame decoder
//! - [`message`]: the typed message set and its payload structures
//! - [`inventory`]: hashes and inventory vectors
//! - [`buffer`]: the inbound byte arena the decoder works on
//!
//! Protocol reference:
//! https://developer.bitcoin.org/reference/p2p_networking.html
pub mod buffer;
pub mod codec;
pub mod constants;
pub mod inventory;
pub mod message;

pub(crate) mod decode;
pub(crate) mod payload;

pub use buffer::ReceiveBuffer;
pub use codec::{Decoded, FrameHeader};
pub use inventory::{AsHash, Hash256, InventoryItem, InventoryType};
pub use message::{Command, Message};
