//! RTP-MIDI style UDP session.
//!
//! `open()` binds the data socket, optionally starts discovery, picks a
//! peer, spawns the session actor and waits (bounded) for negotiation.
//! All socket I/O after that happens on the actor task.

mod actor;
pub mod negotiate;

pub use actor::{NEGOTIATION_RETRY, REPLY_INTERVAL};

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use flexmidi_core::config::{ConfigError, DiscoveryConfig, FlexConfig, SessionConfig};
use flexmidi_core::transport::{
    validate_mtu, SessionPhase, SessionState, SocketOp, Transport, TransportError, UmpBatch,
};
use flexmidi_core::wire::{DiscoveryAnnouncement, Ump128};

use crate::discovery::{self, advertiser, browser, PeerRegistry};
use crate::frame::{frame_capacity, ssrc_from_id, FrameEncoder};
use actor::{Command, SessionActor};
use negotiate::{Proposal, ReplyThrottle};

/// Capacity of the inbound batch channel. Batches arriving while it is
/// full are dropped and counted in [`RtpMidiSession::dropped_inbound`].
pub const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub multicast_addr: Ipv4Addr,
    pub port: u16,
    pub announce_interval: Duration,
    pub peer_ttl: Duration,
    pub wait: Duration,
}

/// Resolved session settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub local_name: String,
    pub bind_addr: SocketAddr,
    /// None = discover, else self-loopback.
    pub peer_addr: Option<SocketAddr>,
    pub mtu: usize,
    pub enable_discovery: bool,
    pub enable_negotiation: bool,
    pub negotiation_timeout: Duration,
    pub require_negotiation: bool,
    pub protocol_version: u8,
    pub group: u8,
    pub channel: u8,
    pub discovery: DiscoveryOptions,
}

impl SessionOptions {
    pub fn from_config(config: &FlexConfig) -> Result<Self, ConfigError> {
        let s = &config.session;
        let d = &config.discovery;
        let bind_addr = s
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidValue("session.bind_addr", s.bind_addr.clone()))?;
        let peer_addr = match s.peer_addr.trim() {
            "" => None,
            addr => Some(addr.parse().map_err(|_| {
                ConfigError::InvalidValue("session.peer_addr", s.peer_addr.clone())
            })?),
        };
        let multicast_addr = d.multicast_addr.parse().map_err(|_| {
            ConfigError::InvalidValue("discovery.multicast_addr", d.multicast_addr.clone())
        })?;
        validate_mtu(s.mtu).map_err(|e| ConfigError::InvalidValue("session.mtu", e.to_string()))?;

        Ok(Self {
            local_name: s.local_name.clone(),
            bind_addr,
            peer_addr,
            mtu: s.mtu,
            enable_discovery: s.enable_discovery,
            enable_negotiation: s.enable_negotiation,
            negotiation_timeout: Duration::from_millis(s.negotiation_timeout_ms),
            require_negotiation: s.require_negotiation,
            protocol_version: s.protocol_version,
            group: s.group,
            channel: s.channel,
            discovery: DiscoveryOptions {
                multicast_addr,
                port: d.port,
                announce_interval: Duration::from_secs(d.announce_interval_secs),
                peer_ttl: Duration::from_secs(d.peer_ttl_secs),
                wait: Duration::from_millis(d.discovery_wait_ms),
            },
        })
    }

    /// Point-to-point defaults with discovery off.
    pub fn point_to_point(bind_addr: SocketAddr, peer_addr: Option<SocketAddr>) -> Self {
        let s = SessionConfig::default();
        Self {
            local_name: s.local_name,
            bind_addr,
            peer_addr,
            mtu: s.mtu,
            enable_discovery: false,
            enable_negotiation: s.enable_negotiation,
            negotiation_timeout: Duration::from_millis(s.negotiation_timeout_ms),
            require_negotiation: s.require_negotiation,
            protocol_version: s.protocol_version,
            group: s.group,
            channel: s.channel,
            discovery: DiscoveryOptions::default(),
        }
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        let d = DiscoveryConfig::default();
        Self {
            multicast_addr: Ipv4Addr::new(239, 255, 77, 77),
            port: d.port,
            announce_interval: Duration::from_secs(d.announce_interval_secs),
            peer_ttl: Duration::from_secs(d.peer_ttl_secs),
            wait: Duration::from_millis(d.discovery_wait_ms),
        }
    }
}

struct Running {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Running {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        for mut task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

/// A UDP transport session.
pub struct RtpMidiSession {
    options: SessionOptions,
    local_id: Uuid,
    registry: PeerRegistry,
    state_tx: Arc<watch::Sender<SessionState>>,
    /// Dropped on close so the inbound channel ends; recreated on reopen.
    inbound_tx: StdMutex<Option<mpsc::Sender<UmpBatch>>>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<UmpBatch>>>,
    cmd_tx: StdMutex<Option<mpsc::Sender<Command>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
    opened_once: AtomicBool,
    dropped_inbound: Arc<AtomicU64>,
}

impl RtpMidiSession {
    pub fn new(options: SessionOptions) -> Self {
        let local_id = Uuid::new_v4();
        let (state_tx, _) = watch::channel(SessionState::new(local_id, options.group, options.channel));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            options,
            local_id,
            registry: discovery::new_registry(),
            state_tx: Arc::new(state_tx),
            inbound_tx: StdMutex::new(Some(inbound_tx)),
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            cmd_tx: StdMutex::new(None),
            local_addr: StdMutex::new(None),
            running: Mutex::new(None),
            opened_once: AtomicBool::new(false),
            dropped_inbound: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Bound data socket address while open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Peers seen by the discovery browser.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Inbound batches dropped because nobody drained the channel.
    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    /// Sender half for the actor. A closed session gets a fresh channel.
    fn inbound_sender(&self) -> mpsc::Sender<UmpBatch> {
        let mut tx = self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = tx.as_ref() {
            return tx.clone();
        }
        let (new_tx, new_rx) = mpsc::channel(INBOUND_CAPACITY);
        *self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner()) = Some(new_rx);
        *tx = Some(new_tx.clone());
        new_tx
    }

    fn set_cmd_tx(&self, tx: Option<mpsc::Sender<Command>>) {
        *self.cmd_tx.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    fn reset_state(&self) {
        let (group, channel) = (self.options.group, self.options.channel);
        self.state_tx
            .send_replace(SessionState::new(self.local_id, group, channel));
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn start(&self) -> Result<Running, TransportError> {
        let socket = UdpSocket::bind(self.options.bind_addr)
            .await
            .map_err(|e| TransportError::socket(SocketOp::Bind, e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| TransportError::socket(SocketOp::Bind, e))?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);

        let (shutdown, _) = broadcast::channel(1);
        let mut running = Running {
            shutdown,
            tasks: Vec::new(),
        };

        if self.options.enable_discovery {
            if let Err(e) = self.start_discovery(&mut running, local_addr.port()) {
                running.stop().await;
                return Err(e);
            }
        }

        let peer = self.resolve_peer(local_addr).await;
        if let Err(e) = socket.connect(peer).await {
            running.stop().await;
            return Err(TransportError::socket(SocketOp::Connect, e));
        }

        let is_self = is_self_addr(peer, local_addr);
        let local_id = self.local_id;
        self.state_tx.send_modify(|state| {
            state.peer_addr = Some(peer);
            if is_self {
                state.remote_id = Some(local_id);
            }
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let proposal = Proposal {
            version: self.options.protocol_version,
            group: self.options.group,
            channel: self.options.channel,
        };
        let actor = SessionActor {
            socket,
            mtu: self.options.mtu,
            encoder: FrameEncoder::new(ssrc_from_id(self.local_id.as_bytes())),
            local_id,
            proposal,
            negotiate: self.options.enable_negotiation && !is_self,
            state_tx: self.state_tx.clone(),
            inbound_tx: self.inbound_sender(),
            dropped_inbound: self.dropped_inbound.clone(),
            replies: ReplyThrottle::new(REPLY_INTERVAL),
            cmd_rx,
            shutdown: running.shutdown.subscribe(),
        };
        running.tasks.push(tokio::spawn(actor.run()));
        self.set_cmd_tx(Some(cmd_tx));

        tracing::info!(
            local = %local_addr,
            peer = %peer,
            id = %self.local_id,
            self_loopback = is_self,
            "session socket ready"
        );

        if self.options.enable_negotiation && !is_self {
            if let Err(e) = self.await_negotiation().await {
                self.set_cmd_tx(None);
                running.stop().await;
                return Err(e);
            }
        }
        Ok(running)
    }

    fn start_discovery(&self, running: &mut Running, session_port: u16) -> Result<(), TransportError> {
        let d = &self.options.discovery;
        let listener = browser::make_listener_socket(d.multicast_addr, d.port).map_err(|e| {
            TransportError::socket(
                SocketOp::Listen,
                std::io::Error::new(std::io::ErrorKind::Other, format!("{e:#}")),
            )
        })?;

        let registry = self.registry.clone();
        let local_id = self.local_id;
        let shutdown = running.shutdown.subscribe();
        running.tasks.push(tokio::spawn(async move {
            if let Err(e) = browser::browse_loop(listener, registry, local_id, shutdown).await {
                tracing::error!(error = %e, "discovery browser failed");
            }
        }));

        running.tasks.push(tokio::spawn(browser::expiry_loop(
            self.registry.clone(),
            d.peer_ttl,
            running.shutdown.subscribe(),
        )));

        let announcement = DiscoveryAnnouncement::new(
            *self.local_id.as_bytes(),
            session_port,
            self.options.protocol_version,
            &self.options.local_name,
        );
        let dest = SocketAddrV4::new(d.multicast_addr, d.port);
        let interval = d.announce_interval;
        let shutdown = running.shutdown.subscribe();
        running.tasks.push(tokio::spawn(async move {
            if let Err(e) = advertiser::advertise_loop(announcement, dest, interval, shutdown).await {
                tracing::error!(error = %e, "discovery advertiser failed");
            }
        }));
        Ok(())
    }

    /// Configured peer, else a discovered one, else ourselves.
    async fn resolve_peer(&self, local_addr: SocketAddr) -> SocketAddr {
        if let Some(peer) = self.options.peer_addr {
            return peer;
        }
        if self.options.enable_discovery {
            let deadline = tokio::time::Instant::now() + self.options.discovery.wait;
            loop {
                if let Some(peer) = discovery::freshest_peer(&self.registry, self.local_id) {
                    tracing::info!(peer = %peer.endpoint_id, name = %peer.name, addr = %peer.addr, "using discovered peer");
                    return peer.addr;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            tracing::info!("no peer discovered, falling back to self-loopback");
        }
        self_loopback_addr(local_addr)
    }

    async fn await_negotiation(&self) -> Result<(), TransportError> {
        let timeout = self.options.negotiation_timeout;
        let mut rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_negotiated()))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::SessionClosed),
            Err(_) if self.options.require_negotiation => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "negotiation timed out");
                Err(TransportError::NegotiationTimeout(timeout.as_millis() as u64))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "negotiation timed out, continuing unnegotiated"
                );
                Ok(())
            }
        }
    }
}

fn self_loopback_addr(local_addr: SocketAddr) -> SocketAddr {
    if local_addr.ip().is_unspecified() {
        let ip = match local_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, local_addr.port())
    } else {
        local_addr
    }
}

fn is_self_addr(peer: SocketAddr, local_addr: SocketAddr) -> bool {
    peer.port() == local_addr.port()
        && (peer.ip() == local_addr.ip()
            || (peer.ip().is_loopback() && local_addr.ip().is_unspecified()))
}

#[async_trait]
impl Transport for RtpMidiSession {
    async fn open(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        frame_capacity(self.options.mtu)?;

        self.state_tx.send_modify(|s| s.phase = SessionPhase::Opening);
        match self.start().await {
            Ok(r) => {
                *running = Some(r);
                self.opened_once.store(true, Ordering::SeqCst);
                self.state_tx.send_modify(|s| s.phase = SessionPhase::Ready);
                Ok(())
            }
            Err(e) => {
                self.reset_state();
                Err(e)
            }
        }
    }

    async fn send(&self, packets: &[Ump128]) -> Result<(), TransportError> {
        let tx = self.cmd_tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(tx) = tx else {
            return Err(if self.opened_once.load(Ordering::SeqCst) {
                TransportError::SessionClosed
            } else {
                TransportError::NotConnected
            });
        };
        if packets.is_empty() {
            return Ok(());
        }

        let (reply, rx) = oneshot::channel();
        tx.send(Command::Send {
            packets: packets.to_vec(),
            reply,
        })
        .await
        .map_err(|_| TransportError::SessionClosed)?;
        rx.await.map_err(|_| TransportError::SessionClosed)?
    }

    async fn close(&self) {
        let mut running = self.running.lock().await;
        let Some(r) = running.take() else {
            return;
        };
        self.set_cmd_tx(None);
        r.stop().await;
        self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.reset_state();
        tracing::info!(id = %self.local_id, "session closed");
    }

    fn take_inbound(&self) -> Result<mpsc::Receiver<UmpBatch>, TransportError> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TransportError::ReceiverTaken)
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn mtu(&self) -> usize {
        self.options.mtu
    }
}

impl Drop for RtpMidiSession {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(r) = running.take() {
                let _ = r.shutdown.send(());
            }
        }
    }
}
