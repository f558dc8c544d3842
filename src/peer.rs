//! Single remote peer.
//!
//! [`Peer`] is a state machine over one connection. The `handle_*` methods
//! take socket events, decode frames and queue outbound bytes, and every
//! observable change is pushed onto the [`PeerEvent`] channel. [`Peer::run`]
//! drives it from a tokio stream, and [`Peer::start`] spawns the whole
//! lifecycle and hands back a [`PeerHandle`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, trace, warn};

use crate::error::{PeerError, PeerResult, PongProblem};
use crate::ledger::{Bitcoin, Ledger};
use crate::network::NetworkParams;
use crate::registry::Registry;
use crate::wire::buffer::ReceiveBuffer;
use crate::wire::codec::Decoded;
use crate::wire::constants::{BIP0031_VERSION, MAX_RECEIVE_BUFFER, PING_INTERVAL};
use crate::wire::message::{Message, Ping, Pong};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerStatus::Disconnected => "disconnected",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
            PeerStatus::Ready => "ready",
        })
    }
}

/// Tunables for a [`Peer`].
#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    /// Buffered inbound bytes above which the peer is dropped.
    pub max_receive_buffer: usize,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Limit on the socket (or proxy) connect.
    pub connect_timeout: Duration,
    /// Size of a single socket read.
    pub read_chunk_size: usize,
    /// Answer an inbound `version` with a `verack`.
    pub send_verack: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_receive_buffer: MAX_RECEIVE_BUFFER,
            ping_interval: PING_INTERVAL,
            connect_timeout: Duration::from_secs(30),
            read_chunk_size: 64 * 1024,
            send_verack: true,
        }
    }
}

#[derive(Debug)]
pub enum PeerEvent<L: Ledger = Bitcoin> {
    /// The socket connected.
    Connect,
    /// The remote acknowledged our `version`.
    Ready,
    /// One decoded inbound message, in stream order.
    Message(Message<L>),
    /// A non-fatal problem, or the transport error preceding a disconnect.
    Error(PeerError),
    Disconnect,
}

/// Requests accepted by a running peer.
#[derive(Debug)]
pub enum PeerCommand<L: Ledger = Bitcoin> {
    Send(Message<L>),
    /// Sent through the ping policy.
    SendBatch(Vec<Message<L>>),
    Ping,
    Disconnect,
}

/// Cloneable remote control for a running [`Peer`].
pub struct PeerHandle<L: Ledger = Bitcoin> {
    commands: mpsc::UnboundedSender<PeerCommand<L>>,
}

impl<L: Ledger> Clone for PeerHandle<L> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<L: Ledger> fmt::Debug for PeerHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl<L: Ledger> PeerHandle<L> {
    fn command(&self, command: PeerCommand<L>) -> PeerResult<()> {
        self.commands.send(command).map_err(|_| PeerError::Closed)
    }

    pub fn send_message(&self, message: Message<L>) -> PeerResult<()> {
        self.command(PeerCommand::Send(message))
    }

    pub fn send_messages(&self, messages: Vec<Message<L>>) -> PeerResult<()> {
        self.command(PeerCommand::SendBatch(messages))
    }

    /// Requests a ping and flushes it right away.
    pub fn ping(&self) -> PeerResult<()> {
        self.command(PeerCommand::Ping)
    }

    pub fn disconnect(&self) -> PeerResult<()> {
        self.command(PeerCommand::Disconnect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Proxy {
    host: String,
    port: u16,
}

#[derive(Debug)]
struct PingState {
    /// Nonce of the outstanding ping. `None` when no pong is expected.
    nonce_sent: Option<[u8; 8]>,
    /// When the last ping went out.
    start: Option<Instant>,
    last_rtt: Option<Duration>,
    queued: bool,
}

impl Default for PingState {
    fn default() -> Self {
        Self {
            nonce_sent: None,
            start: None,
            last_rtt: None,
            queued: true,
        }
    }
}

pub struct PeerBuilder<L: Ledger = Bitcoin> {
    host: String,
    port: Option<u16>,
    registry: Arc<Registry<L>>,
    relay: bool,
    config: PeerConfig,
    proxy: Option<Proxy>,
}

impl PeerBuilder<Bitcoin> {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            registry: Arc::new(Registry::default()),
            relay: true,
            config: PeerConfig::default(),
            proxy: None,
        }
    }
}

impl<L: Ledger> PeerBuilder<L> {
    /// Defaults to the network's port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Switches network, keeping the registry's protocol version.
    pub fn network(mut self, network: NetworkParams) -> Self {
        let protocol_version = self.registry.protocol_version();
        self.registry = Arc::new(
            Registry::builder()
                .ledger::<L>()
                .network(network)
                .protocol_version(protocol_version)
                .build(),
        );
        self
    }

    /// Uses a shared registry. The network comes with it.
    pub fn registry<M: Ledger>(self, registry: Arc<Registry<M>>) -> PeerBuilder<M> {
        PeerBuilder {
            host: self.host,
            port: self.port,
            registry,
            relay: self.relay,
            config: self.config,
            proxy: self.proxy,
        }
    }

    pub fn relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Routes the connection through a SOCKS5 proxy.
    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy = Some(Proxy {
            host: host.into(),
            port,
        });
        self
    }

    pub fn build(self) -> (Peer<L>, mpsc::UnboundedReceiver<PeerEvent<L>>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let port = self
            .port
            .unwrap_or_else(|| self.registry.network().default_port());
        let peer = Peer {
            host: self.host,
            port,
            registry: self.registry,
            config: self.config,
            relay: self.relay,
            proxy: self.proxy,
            status: PeerStatus::Disconnected,
            version: 0,
            subversion: None,
            best_height: 0,
            buffer: ReceiveBuffer::new(),
            ping: PingState::default(),
            outbound: Vec::new(),
            events,
            commands,
            commands_rx: Some(commands_rx),
        };
        (peer, events_rx)
    }
}

enum Step<L: Ledger> {
    Read(std::io::Result<usize>),
    Command(Option<PeerCommand<L>>),
    Keepalive,
}

pub struct Peer<L: Ledger = Bitcoin> {
    host: String,
    port: u16,
    registry: Arc<Registry<L>>,
    config: PeerConfig,
    relay: bool,
    proxy: Option<Proxy>,

    status: PeerStatus,
    version: i32,
    subversion: Option<String>,
    best_height: i32,

    buffer: ReceiveBuffer,
    ping: PingState,
    outbound: Vec<u8>,

    events: mpsc::UnboundedSender<PeerEvent<L>>,
    commands: mpsc::UnboundedSender<PeerCommand<L>>,
    commands_rx: Option<mpsc::UnboundedReceiver<PeerCommand<L>>>,
}

impl<L: Ledger> fmt::Debug for Peer<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("network", &self.network().name())
            .field("status", &self.status)
            .field("version", &self.version)
            .field("subversion", &self.subversion)
            .field("best_height", &self.best_height)
            .finish_non_exhaustive()
    }
}

impl Peer<Bitcoin> {
    pub fn builder(host: impl Into<String>) -> PeerBuilder<Bitcoin> {
        PeerBuilder::new(host)
    }
}

impl<L: Ledger> Peer<L> {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn network(&self) -> &NetworkParams {
        self.registry.network()
    }

    pub fn registry(&self) -> &Arc<Registry<L>> {
        &self.registry
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    /// Protocol version announced by the remote, 0 until its `version`.
    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn subversion(&self) -> Option<&str> {
        self.subversion.as_deref()
    }

    pub fn best_height(&self) -> i32 {
        self.best_height
    }

    pub fn relay(&self) -> bool {
        self.relay
    }

    /// Last measured ping round trip.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.ping.last_rtt
    }

    pub fn proxy(&self) -> Option<(&str, u16)> {
        self.proxy.as_ref().map(|p| (p.host.as_str(), p.port))
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn handle(&self) -> PeerHandle<L> {
        PeerHandle {
            commands: self.commands.clone(),
        }
    }

    /// Routes the next connection through a SOCKS5 proxy.
    pub fn set_proxy(&mut self, host: impl Into<String>, port: u16) -> PeerResult<&mut Self> {
        if self.status != PeerStatus::Disconnected {
            return Err(PeerError::InvalidState(format!(
                "proxy can only be set while disconnected, peer is {}",
                self.status
            )));
        }
        self.proxy = Some(Proxy {
            host: host.into(),
            port,
        });
        Ok(self)
    }

    /// Requests a ping on the next batch flush.
    pub fn ping(&mut self) {
        self.ping.queued = true;
    }

    /// Queues one framed message.
    pub fn send_message(&mut self, message: &Message<L>) {
        trace!(command = %message.command(), host = %self.host, "queue message");
        self.outbound.extend(self.registry.encode(message));
    }

    /// Queues a batch, led by a ping when one is requested or the
    /// keepalive interval has passed without an outstanding ping.
    pub fn send_messages(&mut self, mut messages: Vec<Message<L>>) -> PeerResult<()> {
        let now = Instant::now();
        let due = self.ping.nonce_sent.is_none()
            && self
                .ping
                .start
                .map_or(true, |start| now.duration_since(start) >= self.config.ping_interval);

        if self.ping.queued || due {
            self.ping.queued = false;
            self.ping.start = Some(now);
            let ping = if self.version > BIP0031_VERSION {
                let nonce: [u8; 8] = rand::random();
                self.ping.nonce_sent = Some(nonce);
                Ping::with_nonce(&nonce)?
            } else {
                // Pre-BIP31 peers never answer, so nothing is tracked.
                self.ping.nonce_sent = None;
                Ping::legacy()
            };
            debug!(host = %self.host, legacy = ping.nonce.is_empty(), "sending ping");
            messages.insert(0, Message::Ping(ping));
        }

        for message in &messages {
            self.send_message(message);
        }
        Ok(())
    }

    /// Takes the bytes queued for the socket.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// The socket is up: announce ourselves.
    pub fn handle_connected(&mut self) {
        self.status = PeerStatus::Connected;
        info!(host = %self.host, port = self.port, "peer connected");
        self.emit(PeerEvent::Connect);
        let version = self.registry.version_with_relay(self.relay);
        self.send_message(&version);
    }

    /// Appends a chunk and dispatches every complete frame.
    pub fn handle_data(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk);
        let (size, max) = (self.buffer.len(), self.config.max_receive_buffer);
        if size > max {
            warn!(host = %self.host, size, max, "receive buffer overflow");
            self.emit(PeerEvent::Error(PeerError::ReceiveBufferOverflow { size, max }));
            self.disconnect();
            return;
        }

        while self.status != PeerStatus::Disconnected {
            match self.registry.decode_one(&mut self.buffer) {
                Ok(Decoded::Message(message)) => self.dispatch(message),
                Ok(Decoded::Dropped) => continue,
                Ok(Decoded::NeedMoreData) => break,
                Err(error) => {
                    debug!(host = %self.host, %error, "undecodable frame");
                    self.emit(PeerEvent::Error(error.into()));
                }
            }
        }
    }

    /// A transport error: report it, then disconnect.
    pub fn handle_error(&mut self, error: PeerError) {
        warn!(host = %self.host, %error, "peer error");
        self.emit(PeerEvent::Error(error));
        self.disconnect();
    }

    /// The remote closed the stream.
    pub fn handle_end(&mut self) {
        debug!(host = %self.host, "remote closed the connection");
        self.disconnect();
    }

    /// Drops the connection. Calling it again is a no-op.
    ///
    /// Everything learned from the remote goes with it: an outstanding ping
    /// is abandoned and the next connection starts with a queued ping. Only
    /// the last measured round trip is kept.
    pub fn disconnect(&mut self) {
        if self.status == PeerStatus::Disconnected {
            return;
        }
        info!(host = %self.host, status = %self.status, "peer disconnected");
        self.status = PeerStatus::Disconnected;
        self.buffer.clear();
        self.outbound.clear();
        self.version = 0;
        self.subversion = None;
        self.best_height = 0;
        self.ping = PingState {
            last_rtt: self.ping.last_rtt,
            ..PingState::default()
        };
        self.emit(PeerEvent::Disconnect);
    }

    fn emit(&self, event: PeerEvent<L>) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn dispatch(&mut self, message: Message<L>) {
        trace!(host = %self.host, command = %message.command(), "received");
        match &message {
            Message::VerAck => {
                if self.status != PeerStatus::Ready {
                    self.status = PeerStatus::Ready;
                    info!(host = %self.host, version = self.version, "peer ready");
                    self.emit(PeerEvent::Ready);
                    // First flush: sends the queued ping.
                    if let Err(error) = self.send_messages(Vec::new()) {
                        self.emit(PeerEvent::Error(error));
                    }
                }
            }
            Message::Version(version) => {
                self.version = version.version;
                self.subversion = Some(version.subversion.clone());
                self.best_height = version.start_height;
                debug!(
                    host = %self.host,
                    version = version.version,
                    subversion = %version.subversion,
                    height = version.start_height,
                    "remote version"
                );
                if self.config.send_verack {
                    self.send_message(&Message::VerAck);
                }
            }
            Message::Ping(ping) => {
                if self.version > BIP0031_VERSION {
                    self.send_message(&Message::Pong(ping.reply()));
                }
            }
            Message::Pong(pong) => self.receive_pong(pong),
            _ => {}
        }
        self.emit(PeerEvent::Message(message));
    }

    fn receive_pong(&mut self, pong: &Pong) {
        let received = Instant::now();
        let nonce = <[u8; 8]>::try_from(pong.nonce.as_slice()).ok();

        let (problem, finished) = match (nonce, self.ping.nonce_sent) {
            (None, _) => (Some(PongProblem::ShortPayload), true),
            (Some(_), None) => (Some(PongProblem::Unsolicited), false),
            (Some(nonce), Some(sent)) if nonce == sent => {
                let rtt = self
                    .ping
                    .start
                    .map(|start| received.saturating_duration_since(start))
                    .unwrap_or_default();
                if rtt > Duration::ZERO {
                    self.ping.last_rtt = Some(rtt);
                    debug!(host = %self.host, ?rtt, "ping round trip");
                    (None, true)
                } else {
                    (Some(PongProblem::TimingMishap), true)
                }
            }
            (Some(nonce), Some(_)) if nonce == [0u8; 8] => (Some(PongProblem::NonceZero), true),
            (Some(_), Some(_)) => (Some(PongProblem::NonceMismatch), false),
        };

        if let Some(problem) = problem {
            debug!(host = %self.host, %problem, "pong problem");
            self.emit(PeerEvent::Error(problem.into()));
        }
        if finished {
            self.ping.nonce_sent = None;
        }
    }

    fn apply(&mut self, command: PeerCommand<L>) {
        let flushed = match command {
            PeerCommand::Send(message) => {
                self.send_message(&message);
                Ok(())
            }
            PeerCommand::SendBatch(messages) => self.send_messages(messages),
            PeerCommand::Ping => {
                self.ping();
                self.send_messages(Vec::new())
            }
            PeerCommand::Disconnect => {
                self.disconnect();
                Ok(())
            }
        };
        if let Err(error) = flushed {
            self.emit(PeerEvent::Error(error));
        }
    }

    /// Opens the socket and runs the connection until it closes.
    ///
    /// A failed connect emits the cause as an `Error` event, moves the peer
    /// back to `Disconnected` and returns [`PeerError::Closed`].
    pub async fn connect(&mut self) -> PeerResult<()> {
        if self.status != PeerStatus::Disconnected {
            return Err(PeerError::InvalidState(format!(
                "cannot connect while {}",
                self.status
            )));
        }
        self.status = PeerStatus::Connecting;
        info!(
            host = %self.host,
            port = self.port,
            network = %self.network(),
            proxied = self.proxy.is_some(),
            "connecting to peer"
        );

        let limit = self.config.connect_timeout;
        let dialed = time::timeout(limit, self.dial())
            .await
            .unwrap_or(Err(PeerError::Timeout(limit)));
        match dialed {
            Ok(stream) => self.run(stream).await,
            Err(error) => {
                self.handle_error(error);
                Err(PeerError::Closed)
            }
        }
    }

    async fn dial(&self) -> PeerResult<TcpStream> {
        let target = (self.host.as_str(), self.port);
        match &self.proxy {
            Some(proxy) => {
                let stream =
                    Socks5Stream::connect((proxy.host.as_str(), proxy.port), target).await?;
                Ok(stream.into_inner())
            }
            None => Ok(TcpStream::connect(target).await?),
        }
    }

    /// Drives an already connected stream until the peer disconnects.
    pub async fn run<S>(&mut self, stream: S) -> PeerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut commands = self
            .commands_rx
            .take()
            .ok_or_else(|| PeerError::InvalidState("peer is already running".into()))?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut chunk = vec![0u8; self.config.read_chunk_size.max(1)];

        let period = self.config.ping_interval;
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.handle_connected();

        while self.status != PeerStatus::Disconnected {
            let pending = self.take_outbound();
            if !pending.is_empty() {
                let written = async {
                    writer.write_all(&pending).await?;
                    writer.flush().await
                };
                if let Err(error) = written.await {
                    self.handle_error(error.into());
                    break;
                }
            }

            let step = tokio::select! {
                read = reader.read(&mut chunk) => Step::Read(read),
                command = commands.recv() => Step::Command(command),
                _ = keepalive.tick() => Step::Keepalive,
            };

            match step {
                Step::Read(Ok(0)) => self.handle_end(),
                Step::Read(Ok(n)) => self.handle_data(&chunk[..n]),
                Step::Read(Err(error)) => self.handle_error(error.into()),
                Step::Command(Some(command)) => self.apply(command),
                // `self` holds a sender, so the channel never closes here.
                Step::Command(None) => {}
                Step::Keepalive => {
                    if self.status == PeerStatus::Ready {
                        if let Err(error) = self.send_messages(Vec::new()) {
                            self.emit(PeerEvent::Error(error));
                        }
                    }
                }
            }
        }

        self.commands_rx = Some(commands);
        let _ = writer.shutdown().await;
        Ok(())
    }

    /// Spawns [`Peer::connect`] on the current runtime.
    ///
    /// The task hands the peer back once it has disconnected.
    pub fn start(mut self) -> (PeerHandle<L>, JoinHandle<Self>) {
        let handle = self.handle();
        let task = tokio::spawn(async move {
            if let Err(error) = self.connect().await {
                debug!(host = %self.host, %error, "peer task finished early");
            }
            self
        });
        (handle, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::wire::message::{AddrEntry, Command, NetAddr, Services, Version};
    use tokio::net::TcpListener;

    type Events = mpsc::UnboundedReceiver<PeerEvent>;

    fn peer() -> (Peer, Events) {
        Peer::builder("127.0.0.1").build()
    }

    fn connected() -> (Peer, Events) {
        let (mut peer, mut events) = peer();
        peer.handle_connected();
        peer.take_outbound();
        drain(&mut events);
        (peer, events)
    }

    fn drain(events: &mut Events) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn sent(peer: &mut Peer) -> Vec<Message> {
        let out = peer.take_outbound();
        let mut buffer = ReceiveBuffer::from(&out[..]);
        Registry::default().decode_all(&mut buffer).unwrap()
    }

    fn frame(message: &Message) -> Vec<u8> {
        Registry::default().encode(message)
    }

    fn remote_version(version: i32) -> Vec<u8> {
        frame(&Message::Version(
            Version::new(version)
                .with_subversion("/Satoshi:0.9.1/")
                .with_start_height(300_000),
        ))
    }

    fn messages(events: &[PeerEvent]) -> Vec<Command> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::Message(m) => Some(m.command()),
                _ => None,
            })
            .collect()
    }

    fn pong_problems(events: &[PeerEvent]) -> Vec<PongProblem> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::Error(PeerError::Pong(p)) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// A ready peer speaking `version` with no ping outstanding.
    fn ready(version: i32) -> (Peer, Events) {
        let (mut peer, mut events) = connected();
        peer.handle_data(&remote_version(version));
        peer.handle_data(&frame(&Message::VerAck));
        peer.ping.nonce_sent = None;
        peer.take_outbound();
        drain(&mut events);
        (peer, events)
    }

    #[test]
    fn defaults() {
        let (peer, _events) = peer();
        assert_eq!(peer.status(), PeerStatus::Disconnected);
        assert_eq!(peer.port(), 8333);
        assert_eq!(peer.network().name(), "livenet");
        assert_eq!(peer.version(), 0);
        assert!(peer.relay());
        assert!(peer.ping.queued);

        let (peer, _events) = Peer::builder("localhost")
            .network(NetworkParams::testnet())
            .build();
        assert_eq!(peer.port(), 18333);
        assert_eq!(peer.registry().network().magic(), [0x0b, 0x11, 0x09, 0x07]);

        let (peer, _events) = Peer::builder("localhost").port(9999).build();
        assert_eq!(peer.port(), 9999);
    }

    #[test]
    fn proxy_only_while_disconnected() {
        let (mut peer, _events) = peer();
        peer.set_proxy("127.0.0.1", 9050).unwrap();
        assert_eq!(peer.proxy(), Some(("127.0.0.1", 9050)));

        peer.handle_connected();
        let err = peer.set_proxy("127.0.0.1", 9051).unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));
        assert_eq!(peer.proxy(), Some(("127.0.0.1", 9050)));
    }

    #[test]
    fn connect_sends_version_with_relay() {
        let (mut peer, mut events) = Peer::builder("127.0.0.1").relay(false).build();
        peer.handle_connected();
        assert_eq!(peer.status(), PeerStatus::Connected);
        assert!(matches!(drain(&mut events)[..], [PeerEvent::Connect]));

        let out = sent(&mut peer);
        assert_eq!(out.len(), 1);
        let Message::Version(version) = &out[0] else {
            panic!("expected version, got {:?}", out[0]);
        };
        assert!(!version.relay);
        assert_eq!(version.version, 70000);
    }

    #[test]
    fn version_is_recorded_and_acknowledged() {
        let (mut peer, mut events) = connected();
        peer.handle_data(&remote_version(70002));
        assert_eq!(peer.version(), 70002);
        assert_eq!(peer.subversion(), Some("/Satoshi:0.9.1/"));
        assert_eq!(peer.best_height(), 300_000);
        assert_eq!(messages(&drain(&mut events)), vec![Command::Version]);
        assert_eq!(sent(&mut peer), vec![Message::VerAck]);

        let config = PeerConfig {
            send_verack: false,
            ..PeerConfig::default()
        };
        let (mut peer, _events) = Peer::builder("127.0.0.1").config(config).build();
        peer.handle_connected();
        peer.take_outbound();
        peer.handle_data(&remote_version(70002));
        assert!(peer.take_outbound().is_empty());
    }

    #[test]
    fn verack_makes_ready_once() {
        let (mut peer, mut events) = connected();
        peer.handle_data(&frame(&Message::VerAck));
        peer.handle_data(&frame(&Message::VerAck));
        assert_eq!(peer.status(), PeerStatus::Ready);

        let events = drain(&mut events);
        let readies = events.iter().filter(|e| matches!(e, PeerEvent::Ready)).count();
        assert_eq!(readies, 1);
        assert!(matches!(events[0], PeerEvent::Ready));
        assert_eq!(messages(&events), vec![Command::VerAck, Command::VerAck]);
    }

    #[test]
    fn ready_flushes_the_initial_ping() {
        let (mut peer, _events) = connected();
        peer.handle_data(&remote_version(70002));
        peer.take_outbound();
        peer.handle_data(&frame(&Message::VerAck));

        let out = sent(&mut peer);
        let [Message::Ping(ping)] = &out[..] else {
            panic!("expected a single ping, got {out:?}");
        };
        assert_eq!(ping.nonce.len(), 8);
        assert_eq!(peer.ping.nonce_sent.as_ref().map(|n| &n[..]), Some(&ping.nonce[..]));
        assert!(!peer.ping.queued);
    }

    #[test]
    fn ping_policy_for_legacy_peer() {
        let (mut peer, _events) = connected();
        assert_eq!(peer.version(), 0);

        peer.send_messages(vec![Message::GetAddr]).unwrap();
        let out = sent(&mut peer);
        assert_eq!(out, vec![Message::Ping(Ping::legacy()), Message::GetAddr]);
        assert!(peer.ping.nonce_sent.is_none());

        // interval not elapsed, nothing requested
        peer.send_messages(vec![Message::Mempool]).unwrap();
        assert_eq!(sent(&mut peer), vec![Message::Mempool]);

        peer.ping();
        peer.send_messages(Vec::new()).unwrap();
        assert_eq!(sent(&mut peer), vec![Message::Ping(Ping::legacy())]);
    }

    #[test]
    fn queued_ping_leads_the_batch() {
        let (mut peer, _events) = connected();
        assert!(peer.ping.queued);
        peer.send_messages(vec![Message::GetAddr, Message::Mempool]).unwrap();
        assert_eq!(
            sent(&mut peer),
            vec![Message::Ping(Ping::legacy()), Message::GetAddr, Message::Mempool]
        );
    }

    #[test]
    fn reconnect_starts_from_a_clean_slate() {
        let (mut peer, _events) = connected();
        peer.handle_data(&remote_version(70002));
        peer.handle_data(&frame(&Message::VerAck));
        assert_eq!(peer.status(), PeerStatus::Ready);
        assert!(peer.ping.nonce_sent.is_some());
        peer.take_outbound();

        peer.disconnect();
        peer.handle_connected();
        assert_eq!(peer.version(), 0);
        assert_eq!(peer.subversion(), None);
        assert_eq!(peer.best_height(), 0);
        assert!(peer.ping.queued);
        assert!(peer.ping.nonce_sent.is_none());
        peer.take_outbound();

        peer.handle_data(&remote_version(70002));
        peer.handle_data(&frame(&Message::VerAck));
        let out = sent(&mut peer);
        let Some(Message::Ping(ping)) = out.last() else {
            panic!("expected a ping, got {out:?}");
        };
        assert_eq!(ping.nonce.len(), 8);
        assert!(peer.ping.nonce_sent.is_some());
    }

    #[test]
    fn ping_policy_tracks_nonce() {
        let (mut peer, _events) = ready(70002);
        peer.ping();
        peer.send_messages(Vec::new()).unwrap();
        let out = sent(&mut peer);
        let [Message::Ping(first)] = &out[..] else {
            panic!("expected ping, got {out:?}");
        };
        assert_eq!(first.nonce.len(), 8);

        // outstanding nonce blocks the keepalive, not an explicit request
        peer.send_messages(Vec::new()).unwrap();
        assert!(sent(&mut peer).is_empty());
        peer.ping();
        peer.send_messages(Vec::new()).unwrap();
        let out = sent(&mut peer);
        let [Message::Ping(second)] = &out[..] else {
            panic!("expected ping, got {out:?}");
        };
        assert_ne!(first.nonce, second.nonce);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_after_interval() {
        let (mut peer, _events) = ready(70002);
        peer.ping();
        peer.send_messages(Vec::new()).unwrap();
        peer.ping.nonce_sent = None;
        peer.take_outbound();

        time::advance(PING_INTERVAL - Duration::from_secs(1)).await;
        peer.send_messages(Vec::new()).unwrap();
        assert!(peer.take_outbound().is_empty());

        time::advance(Duration::from_secs(1)).await;
        peer.send_messages(Vec::new()).unwrap();
        assert!(matches!(sent(&mut peer)[..], [Message::Ping(_)]));
    }

    #[test]
    fn pong_only_for_bip31_peers() {
        let nonce = [7u8; 8];
        let ping = frame(&Message::Ping(Ping::with_nonce(&nonce).unwrap()));

        let (mut peer, _events) = ready(70002);
        peer.handle_data(&ping);
        assert_eq!(
            sent(&mut peer),
            vec![Message::Pong(Pong::with_nonce(&nonce).unwrap())]
        );

        let (mut peer, _events) = ready(BIP0031_VERSION);
        peer.handle_data(&ping);
        assert!(peer.take_outbound().is_empty());
    }

    #[test]
    fn pong_problems_are_reported() {
        let pong = |nonce: &[u8]| frame(&Message::Pong(Pong { nonce: nonce.to_vec() }));

        // short payload
        let (mut peer, mut events) = ready(70002);
        peer.ping.nonce_sent = Some([1; 8]);
        peer.handle_data(&pong(&[1, 2, 3]));
        let seen = drain(&mut events);
        assert_eq!(pong_problems(&seen), vec![PongProblem::ShortPayload]);
        assert_eq!(messages(&seen), vec![Command::Pong]);
        assert!(peer.ping.nonce_sent.is_none());

        // empty payload
        peer.ping.nonce_sent = Some([1; 8]);
        peer.handle_data(&frame(&Message::Pong(Pong::legacy())));
        assert_eq!(pong_problems(&drain(&mut events)), vec![PongProblem::ShortPayload]);
        assert!(peer.ping.nonce_sent.is_none());

        // unsolicited
        peer.handle_data(&pong(&[1; 8]));
        assert_eq!(pong_problems(&drain(&mut events)), vec![PongProblem::Unsolicited]);

        // mismatch keeps the ping outstanding
        peer.ping.nonce_sent = Some([1; 8]);
        peer.handle_data(&pong(&[2; 8]));
        assert_eq!(pong_problems(&drain(&mut events)), vec![PongProblem::NonceMismatch]);
        assert_eq!(peer.ping.nonce_sent, Some([1; 8]));

        // zero nonce cancels it
        peer.handle_data(&pong(&[0; 8]));
        assert_eq!(pong_problems(&drain(&mut events)), vec![PongProblem::NonceZero]);
        assert!(peer.ping.nonce_sent.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_measures_round_trip() {
        let (mut peer, mut events) = ready(70002);
        peer.ping();
        peer.send_messages(Vec::new()).unwrap();
        let out = sent(&mut peer);
        let [Message::Ping(ping)] = &out[..] else {
            panic!("expected ping, got {out:?}");
        };

        time::advance(Duration::from_millis(250)).await;
        peer.handle_data(&frame(&Message::Pong(ping.reply())));
        assert_eq!(peer.last_rtt(), Some(Duration::from_millis(250)));
        assert!(peer.ping.nonce_sent.is_none());
        assert!(pong_problems(&drain(&mut events)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_round_trip_is_a_timing_mishap() {
        let (mut peer, mut events) = ready(70002);
        peer.ping();
        peer.send_messages(Vec::new()).unwrap();
        let out = sent(&mut peer);
        let [Message::Ping(ping)] = &out[..] else {
            panic!("expected ping, got {out:?}");
        };

        peer.handle_data(&frame(&Message::Pong(ping.reply())));
        assert_eq!(pong_problems(&drain(&mut events)), vec![PongProblem::TimingMishap]);
        assert!(peer.ping.nonce_sent.is_none());
        assert_eq!(peer.last_rtt(), None);
    }

    #[test]
    fn buffer_overflow_disconnects() {
        let config = PeerConfig {
            max_receive_buffer: 100,
            ..PeerConfig::default()
        };
        let (mut peer, mut events) = Peer::builder("127.0.0.1").config(config).build();
        peer.handle_connected();
        drain(&mut events);

        let mut data = Vec::new();
        while data.len() <= 100 {
            data.extend(frame(&Message::GetAddr));
        }
        peer.handle_data(&data);

        assert_eq!(peer.status(), PeerStatus::Disconnected);
        assert_eq!(peer.buffered(), 0);
        let seen = drain(&mut events);
        assert!(matches!(
            seen[..],
            [
                PeerEvent::Error(PeerError::ReceiveBufferOverflow { max: 100, .. }),
                PeerEvent::Disconnect
            ]
        ));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut peer, mut events) = connected();
        peer.disconnect();
        peer.disconnect();
        let seen = drain(&mut events);
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], PeerEvent::Disconnect));

        let (mut peer, mut events) = connected();
        peer.handle_error(PeerError::Io(std::io::ErrorKind::ConnectionReset.into()));
        let seen = drain(&mut events);
        assert!(matches!(seen[..], [PeerEvent::Error(PeerError::Io(_)), PeerEvent::Disconnect]));
    }

    #[test]
    fn frame_errors_do_not_stop_draining() {
        let malicious = hex::decode(
            "f9beb4d96d616c6963696f757300000025000000bd5e830c0102000000ec3995c1bf7269ff728818a65e53af00cbbee6b6eca8ac9ce7bc79d877041ed8",
        )
        .unwrap();
        let (mut peer, mut events) = connected();
        let mut data = malicious;
        data.extend(frame(&Message::VerAck));
        peer.handle_data(&data);

        let seen = drain(&mut events);
        assert!(matches!(
            &seen[0],
            PeerEvent::Error(PeerError::Frame(FrameError::UnsupportedCommand(c))) if c == "malicious"
        ));
        assert!(matches!(seen[1], PeerEvent::Ready));
        assert_eq!(messages(&seen), vec![Command::VerAck]);
    }

    /// Version, verack, 18 inv and 4 addr frames, as a node would send
    /// them after the handshake.
    fn synthetic_dump() -> Vec<u8> {
        let reg = Registry::default();
        let mut dump = remote_version(70002);
        dump.extend(reg.encode(&reg.verack()));
        for i in 0..18u8 {
            let message = reg.inventory().for_transaction(&[i; 32]).unwrap();
            dump.extend(reg.encode(&message));
        }
        for i in 0..4u8 {
            let entry = AddrEntry {
                timestamp: 1_400_000_000 + u32::from(i),
                addr: NetAddr::new(
                    Services::NODE_NETWORK,
                    format!("10.0.0.{i}").parse().unwrap(),
                    8333,
                ),
            };
            dump.extend(reg.encode(&reg.addr(vec![entry]).unwrap()));
        }
        dump
    }

    fn count(commands: &[Command], command: Command) -> usize {
        commands.iter().filter(|c| **c == command).count()
    }

    #[test]
    fn dump_dispatches_every_frame() {
        let dump = synthetic_dump();
        for chunk_size in [dump.len(), 1, 7, 24, 100] {
            let (mut peer, mut events) = connected();
            for chunk in dump.chunks(chunk_size) {
                peer.handle_data(chunk);
            }
            let commands = messages(&drain(&mut events));
            assert_eq!(commands.len(), 24, "chunk size {chunk_size}");
            assert_eq!(commands[0], Command::Version);
            assert_eq!(commands[1], Command::VerAck);
            assert_eq!(count(&commands, Command::Inv), 18);
            assert_eq!(count(&commands, Command::Addr), 4);
            assert_eq!(peer.buffered(), 0);
        }
    }

    async fn next_frame(stream: &mut TcpStream, buffer: &mut ReceiveBuffer) -> Message {
        let reg = Registry::default();
        loop {
            if let Decoded::Message(message) = reg.decode_one(buffer).unwrap() {
                return message;
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed the connection");
            buffer.extend(&chunk[..n]);
        }
    }

    async fn next_event(events: &mut Events) -> PeerEvent {
        time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn loopback_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (peer, mut events) = Peer::builder("127.0.0.1").port(port).build();
        let (handle, task) = peer.start();
        let (mut remote, _) = listener.accept().await.unwrap();
        let mut buffer = ReceiveBuffer::new();

        assert!(matches!(next_event(&mut events).await, PeerEvent::Connect));
        assert!(matches!(next_frame(&mut remote, &mut buffer).await, Message::Version(_)));

        remote.write_all(&remote_version(70002)).await.unwrap();
        remote.write_all(&frame(&Message::VerAck)).await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            PeerEvent::Message(Message::Version(_))
        ));
        assert!(matches!(next_event(&mut events).await, PeerEvent::Ready));
        assert!(matches!(
            next_event(&mut events).await,
            PeerEvent::Message(Message::VerAck)
        ));

        assert_eq!(next_frame(&mut remote, &mut buffer).await, Message::VerAck);
        let Message::Ping(ping) = next_frame(&mut remote, &mut buffer).await else {
            panic!("expected ping");
        };
        assert_eq!(ping.nonce.len(), 8);

        handle.send_message(Message::GetAddr).unwrap();
        assert_eq!(next_frame(&mut remote, &mut buffer).await, Message::GetAddr);

        handle.disconnect().unwrap();
        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect));
        let peer = task.await.unwrap();
        assert_eq!(peer.status(), PeerStatus::Disconnected);
        assert_eq!(peer.version(), 0);
    }

    #[tokio::test]
    async fn remote_close_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (peer, mut events) = Peer::builder("127.0.0.1").port(port).build();
        let (_handle, task) = peer.start();
        let (mut remote, _) = listener.accept().await.unwrap();

        assert!(matches!(next_event(&mut events).await, PeerEvent::Connect));
        // read the version first so the close is a clean FIN
        let mut buffer = ReceiveBuffer::new();
        assert!(matches!(next_frame(&mut remote, &mut buffer).await, Message::Version(_)));
        drop(remote);
        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect));
        assert_eq!(task.await.unwrap().status(), PeerStatus::Disconnected);
    }

    #[tokio::test]
    async fn refused_connect_returns_to_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut peer, mut events) = Peer::builder("127.0.0.1").port(port).build();
        let err = peer.connect().await.unwrap_err();
        assert!(matches!(err, PeerError::Closed));
        assert_eq!(peer.status(), PeerStatus::Disconnected);
        assert!(matches!(
            drain(&mut events)[..],
            [PeerEvent::Error(PeerError::Io(_)), PeerEvent::Disconnect]
        ));
    }

    #[tokio::test]
    async fn refused_start_reports_the_cause() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (peer, mut events) = Peer::builder("127.0.0.1").port(port).build();
        let (_handle, task) = peer.start();
        assert!(matches!(
            next_event(&mut events).await,
            PeerEvent::Error(PeerError::Io(_))
        ));
        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect));
        assert_eq!(task.await.unwrap().status(), PeerStatus::Disconnected);
    }

    #[tokio::test]
    async fn connect_requires_disconnected() {
        let (mut peer, _events) = connected();
        let err = peer.connect().await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidState(_)));
    }
}
