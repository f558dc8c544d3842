//! Bitcoin peer-to-peer networking.
//!
//! A [`Registry`] builds and parses the 21 protocol messages for one
//! network, the [`wire::codec`] frames them, and a [`Peer`] runs one
//! connection: handshake, keepalive pings and inbound dispatch.
//!
//! ```no_run
//! use btc_p2p::{Message, Peer, PeerEvent};
//!
//! # async fn demo() {
//! let (peer, mut events) = Peer::builder("127.0.0.1").build();
//! let (handle, _task) = peer.start();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         PeerEvent::Ready => {
//!             let _ = handle.send_message(Message::GetAddr);
//!         }
//!         PeerEvent::Message(Message::Addr(entries)) => println!("{} addresses", entries.len()),
//!         PeerEvent::Disconnect => break,
//!         _ => {}
//!     }
//! }
//! # }
//! ```
pub mod bloom;
pub mod error;
pub mod ledger;
pub mod network;
pub mod peer;
pub mod registry;
pub mod wire;

pub use bloom::{BloomFilter, BloomFlags};
pub use error::{
    CodecError, FrameError, MessageError, MessageResult, PeerError, PeerResult, PongProblem,
};
pub use ledger::{Bitcoin, Ledger, WireCodec};
pub use network::NetworkParams;
pub use peer::{Peer, PeerBuilder, PeerCommand, PeerConfig, PeerEvent, PeerHandle, PeerStatus};
pub use registry::{InventoryCommand, Registry, RegistryBuilder};
pub use wire::{Command, Message};
