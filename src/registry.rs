//! Message registry.
//!
//! A [`Registry`] binds the 21 known commands to one network, one protocol
//! version and one set of ledger codecs. It is immutable once built and can
//! be shared between peers behind an `Arc`.

use std::fmt;
use std::marker::PhantomData;

use crate::bloom::BloomFilter;
use crate::error::{FrameError, MessageError, MessageResult};
use crate::ledger::{Bitcoin, Ledger};
use crate::network::NetworkParams;
use crate::wire::buffer::ReceiveBuffer;
use crate::wire::codec::{self, Decoded};
use crate::wire::constants::{MAX_ADDR_ENTRIES, MAX_HEADERS, MAX_INV_ENTRIES, PROTOCOL_VERSION};
use crate::wire::inventory::{AsHash, InventoryItem};
use crate::wire::message::{
    AddrEntry, Alert, BlockLocator, Command, FilterAdd, Message, Ping, Pong, Reject, Version,
};

pub struct Registry<L: Ledger = Bitcoin> {
    network: NetworkParams,
    protocol_version: i32,
    _ledger: PhantomData<fn() -> L>,
}

impl<L: Ledger> Clone for Registry<L> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            protocol_version: self.protocol_version,
            _ledger: PhantomData,
        }
    }
}

impl<L: Ledger> fmt::Debug for Registry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("network", &self.network.name())
            .field("protocol_version", &self.protocol_version)
            .field("ledger", &std::any::type_name::<L>())
            .finish()
    }
}

/// Builds a [`Registry`]. Unset fields fall back to mainnet and protocol
/// version 70000.
pub struct RegistryBuilder<L: Ledger = Bitcoin> {
    network: Option<NetworkParams>,
    protocol_version: Option<i32>,
    _ledger: PhantomData<fn() -> L>,
}

impl<L: Ledger> RegistryBuilder<L> {
    pub fn network(mut self, network: NetworkParams) -> Self {
        self.network = Some(network);
        self
    }

    pub fn protocol_version(mut self, version: i32) -> Self {
        self.protocol_version = Some(version);
        self
    }

    /// Switches to another set of ledger codecs.
    pub fn ledger<M: Ledger>(self) -> RegistryBuilder<M> {
        RegistryBuilder {
            network: self.network,
            protocol_version: self.protocol_version,
            _ledger: PhantomData,
        }
    }

    pub fn build(self) -> Registry<L> {
        Registry {
            network: self.network.unwrap_or_default(),
            protocol_version: self.protocol_version.unwrap_or(PROTOCOL_VERSION),
            _ledger: PhantomData,
        }
    }
}

impl Registry<Bitcoin> {
    pub fn builder() -> RegistryBuilder<Bitcoin> {
        RegistryBuilder {
            network: None,
            protocol_version: None,
            _ledger: PhantomData,
        }
    }
}

impl Default for Registry<Bitcoin> {
    fn default() -> Self {
        Registry::builder().build()
    }
}

impl<L: Ledger> Registry<L> {
    pub fn network(&self) -> &NetworkParams {
        &self.network
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    /// Every command the registry can build.
    pub fn commands(&self) -> &'static [Command] {
        &Command::ALL
    }

    /// Looks up a command by its wire name.
    pub fn command(&self, name: &str) -> Option<Command> {
        Command::from_name(name)
    }

    /// The argument-less form of `command`.
    pub fn empty(&self, command: Command) -> Message<L> {
        match command {
            Command::Version => self.version(),
            Command::VerAck => Message::VerAck,
            Command::Ping => Message::Ping(Ping::new()),
            Command::Pong => Message::Pong(Pong::new()),
            Command::Addr => Message::Addr(Vec::new()),
            Command::Inv => Message::Inventory(Vec::new()),
            Command::GetData => Message::GetData(Vec::new()),
            Command::NotFound => Message::NotFound(Vec::new()),
            Command::GetBlocks => Message::GetBlocks(self.empty_locator()),
            Command::GetHeaders => Message::GetHeaders(self.empty_locator()),
            Command::Headers => Message::Headers(Vec::new()),
            Command::Tx => Message::Tx(None),
            Command::Block => Message::Block(None),
            Command::MerkleBlock => Message::MerkleBlock(None),
            Command::FilterLoad => Message::FilterLoad(None),
            Command::FilterAdd => Message::FilterAdd(FilterAdd::default()),
            Command::FilterClear => Message::FilterClear,
            Command::Mempool => Message::Mempool,
            Command::GetAddr => Message::GetAddr,
            Command::Alert => Message::Alert(Alert::default()),
            Command::Reject => Message::Reject(None),
        }
    }

    /// Builds the variant for `command` from its payload.
    pub fn from_buffer(&self, command: Command, payload: &[u8]) -> MessageResult<Message<L>> {
        Message::decode_payload(command, payload)
    }

    /// Frames `message` for this registry's network.
    pub fn encode(&self, message: &Message<L>) -> Vec<u8> {
        codec::encode(message, &self.network)
    }

    /// See [`codec::decode_one`].
    pub fn decode_one(&self, buffer: &mut ReceiveBuffer) -> Result<Decoded<L>, FrameError> {
        codec::decode_one(buffer, &self.network, self)
    }

    /// See [`codec::decode_all`].
    pub fn decode_all(&self, buffer: &mut ReceiveBuffer) -> Result<Vec<Message<L>>, FrameError> {
        codec::decode_all(buffer, &self.network, self)
    }

    // --- typed constructors ---

    pub fn version(&self) -> Message<L> {
        Message::Version(Version::new(self.protocol_version))
    }

    pub fn version_with_relay(&self, relay: bool) -> Message<L> {
        Message::Version(Version::new(self.protocol_version).with_relay(relay))
    }

    pub fn verack(&self) -> Message<L> {
        Message::VerAck
    }

    /// A `ping` with a fresh random nonce.
    pub fn ping(&self) -> Message<L> {
        Message::Ping(Ping::new())
    }

    pub fn ping_with_nonce(&self, nonce: &[u8]) -> MessageResult<Message<L>> {
        Ok(Message::Ping(Ping::with_nonce(nonce)?))
    }

    pub fn pong(&self, nonce: &[u8]) -> MessageResult<Message<L>> {
        Ok(Message::Pong(Pong::with_nonce(nonce)?))
    }

    pub fn addr(&self, entries: Vec<AddrEntry>) -> MessageResult<Message<L>> {
        check_len("addresses", entries.len(), MAX_ADDR_ENTRIES)?;
        Ok(Message::Addr(entries))
    }

    pub fn get_addr(&self) -> Message<L> {
        Message::GetAddr
    }

    pub fn inventory(&self) -> InventoryCommand<'_, L> {
        InventoryCommand::new(self, Command::Inv)
    }

    pub fn get_data(&self) -> InventoryCommand<'_, L> {
        InventoryCommand::new(self, Command::GetData)
    }

    pub fn not_found(&self) -> InventoryCommand<'_, L> {
        InventoryCommand::new(self, Command::NotFound)
    }

    /// Inventory helpers for `command`, if it carries an inventory vector.
    pub fn inventory_command(&self, command: Command) -> Option<InventoryCommand<'_, L>> {
        command
            .is_inventory()
            .then(|| InventoryCommand::new(self, command))
    }

    /// A locator at this registry's protocol version with a zero stop hash.
    pub fn locator<I>(&self, starts: I) -> MessageResult<BlockLocator>
    where
        I: IntoIterator,
        I::Item: AsHash,
    {
        BlockLocator::new(self.protocol_version as u32, starts)
    }

    fn empty_locator(&self) -> BlockLocator {
        BlockLocator {
            version: self.protocol_version as u32,
            ..BlockLocator::default()
        }
    }

    pub fn get_blocks(&self, locator: BlockLocator) -> Message<L> {
        Message::GetBlocks(locator)
    }

    pub fn get_headers(&self, locator: BlockLocator) -> Message<L> {
        Message::GetHeaders(locator)
    }

    /// A non-empty `headers` message.
    pub fn headers(&self, headers: Vec<L::BlockHeader>) -> MessageResult<Message<L>> {
        if headers.is_empty() {
            return Err(MessageError::InvalidArgument(
                "First argument is expected to be an array of block headers".into(),
            ));
        }
        check_len("headers", headers.len(), MAX_HEADERS)?;
        Ok(Message::Headers(headers))
    }

    pub fn transaction(&self, tx: Option<L::Transaction>) -> Message<L> {
        Message::Tx(tx)
    }

    pub fn block(&self, block: Option<L::Block>) -> Message<L> {
        Message::Block(block)
    }

    pub fn merkle_block(&self, merkle_block: Option<L::MerkleBlock>) -> Message<L> {
        Message::MerkleBlock(merkle_block)
    }

    pub fn filter_load(&self, filter: Option<BloomFilter>) -> MessageResult<Message<L>> {
        if let Some(filter) = &filter {
            filter.validate()?;
        }
        Ok(Message::FilterLoad(filter))
    }

    pub fn filter_add(&self, data: impl Into<Vec<u8>>) -> MessageResult<Message<L>> {
        Ok(Message::FilterAdd(FilterAdd::new(data)?))
    }

    pub fn filter_clear(&self) -> Message<L> {
        Message::FilterClear
    }

    pub fn mempool(&self) -> Message<L> {
        Message::Mempool
    }

    pub fn alert(&self, payload: Vec<u8>, signature: Vec<u8>) -> Message<L> {
        Message::Alert(Alert { payload, signature })
    }

    pub fn reject(&self, reject: Option<Reject>) -> Message<L> {
        Message::Reject(reject)
    }
}

fn check_len(what: &'static str, count: usize, max: usize) -> MessageResult<()> {
    if count > max {
        return Err(MessageError::TooManyEntries { what, count, max });
    }
    Ok(())
}

/// Constructors shared by `inv`, `getdata` and `notfound`.
///
/// String hashes are display-order hex and are reversed; byte hashes are
/// taken as internal order.
pub struct InventoryCommand<'a, L: Ledger> {
    registry: &'a Registry<L>,
    command: Command,
}

impl<'a, L: Ledger> InventoryCommand<'a, L> {
    fn new(registry: &'a Registry<L>, command: Command) -> Self {
        Self { registry, command }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn registry(&self) -> &'a Registry<L> {
        self.registry
    }

    /// Wraps a list of items.
    pub fn with_items(&self, items: Vec<InventoryItem>) -> MessageResult<Message<L>> {
        check_len("inventory items", items.len(), MAX_INV_ENTRIES)?;
        Ok(match self.command {
            Command::GetData => Message::GetData(items),
            Command::NotFound => Message::NotFound(items),
            _ => Message::Inventory(items),
        })
    }

    pub fn for_transaction<H: AsHash + ?Sized>(&self, hash: &H) -> MessageResult<Message<L>> {
        self.with_items(vec![InventoryItem::for_transaction(hash)?])
    }

    pub fn for_block<H: AsHash + ?Sized>(&self, hash: &H) -> MessageResult<Message<L>> {
        self.with_items(vec![InventoryItem::for_block(hash)?])
    }

    pub fn for_filtered_block<H: AsHash + ?Sized>(&self, hash: &H) -> MessageResult<Message<L>> {
        self.with_items(vec![InventoryItem::for_filtered_block(hash)?])
    }

    /// Alias of [`InventoryCommand::for_filtered_block`].
    pub fn for_merkle_block<H: AsHash + ?Sized>(&self, hash: &H) -> MessageResult<Message<L>> {
        self.with_items(vec![InventoryItem::for_merkle_block(hash)?])
    }
}
