//! Transport reactor: one UDP endpoint serviced on a dedicated thread
//!
//! The reactor thread owns the socket and the [`Host`] slot table. Game code
//! talks to it through a cloneable [`ReactorHandle`] (fire-and-forget
//! commands over a bounded channel) and sees its results only when it calls
//! [`Reactor::poll`], which drains the bounded inbound queue on the calling
//! thread.

use super::host::{Host, HostConfig, HostEvent};
use crate::error::TransportError;
use crossbeam_channel::{self as channel, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use shared::{Delivery, EncodedPacket, PeerId};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Completion callback of a connection request. Invoked exactly once, on the
/// reactor thread, with the new peer id or [`PeerId::INVALID`].
pub type ConnectCallback = Box<dyn FnOnce(PeerId) + Send>;

/// Events surfaced to the owning thread by [`Reactor::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Connect { peer: PeerId, outgoing: bool, data: u32 },
    Disconnect { peer: PeerId, data: u32 },
    Packet { peer: PeerId, channel: u8, bytes: Vec<u8> },
    PeerInfo { peer: PeerId, ping: u32, idle: u32 },
}

impl InboundEvent {
    /// Lifecycle events are never dropped when the inbound queue is full.
    fn is_lifecycle(&self) -> bool {
        matches!(self, InboundEvent::Connect { .. } | InboundEvent::Disconnect { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Free the slot now and report the disconnect without a handshake.
    Kick,
    /// Disconnect after queued reliable payloads are delivered.
    Later,
    /// Graceful close; reported when the transport completes it.
    Normal,
}

/// Requests applied by the reactor thread.
pub enum OutboundEvent {
    Connect {
        addr: SocketAddr,
        data: u32,
        callback: ConnectCallback,
    },
    Disconnect {
        peer: PeerId,
        data: u32,
        kind: DisconnectKind,
    },
    Packet {
        peer: PeerId,
        channel: u8,
        delivery: Delivery,
        bytes: Vec<u8>,
    },
    QueryInfo {
        peer: PeerId,
    },
}

/// Receives drained inbound events on the polling thread.
pub trait TransportHandler {
    fn on_connect(&mut self, peer: PeerId, outgoing: bool, data: u32);
    fn on_disconnect(&mut self, peer: PeerId, data: u32);
    fn on_packet(&mut self, peer: PeerId, channel: u8, bytes: Vec<u8>);
    fn on_peer_info(&mut self, _peer: PeerId, _ping: u32, _idle: u32) {}
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub bind: SocketAddr,
    /// First peer id of this reactor's slot range.
    pub base_id: u32,
    pub host: HostConfig,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub service_interval: Duration,
}

impl ReactorConfig {
    pub fn new(bind: SocketAddr, base_id: u32, max_peers: usize) -> Self {
        Self {
            bind,
            base_id,
            host: HostConfig {
                max_peers,
                ..HostConfig::default()
            },
            inbound_capacity: 4096,
            outbound_capacity: 4096,
            service_interval: Duration::from_millis(10),
        }
    }
}

/// Cloneable front end for queuing commands to a reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    base_id: u32,
    max_peers: usize,
    connect_guard: Duration,
    commands: mpsc::Sender<OutboundEvent>,
}

impl ReactorHandle {
    /// Whether `peer` belongs to this reactor's slot range.
    pub fn owns(&self, peer: PeerId) -> bool {
        peer.slot(self.base_id, self.max_peers).is_some()
    }

    fn enqueue(&self, event: OutboundEvent) -> Result<(), OutboundEvent> {
        match self.commands.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Reactor command queue full");
                Err(event)
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!("Reactor stopped, dropping command");
                Err(event)
            }
        }
    }

    pub fn send(&self, peer: PeerId, channel: u8, delivery: Delivery, bytes: Vec<u8>) {
        if !self.owns(peer) {
            return;
        }
        let _ = self.enqueue(OutboundEvent::Packet {
            peer,
            channel,
            delivery,
            bytes,
        });
    }

    /// Sends a packet encoded by a command registry.
    pub fn send_packet(&self, peer: PeerId, packet: EncodedPacket) {
        self.send(peer, packet.channel, packet.delivery, packet.bytes);
    }

    pub fn disconnect(&self, peer: PeerId, data: u32, kind: DisconnectKind) {
        if self.owns(peer) {
            let _ = self.enqueue(OutboundEvent::Disconnect { peer, data, kind });
        }
    }

    /// Requests a [`InboundEvent::PeerInfo`] for `peer`.
    pub fn query_info(&self, peer: PeerId) {
        if self.owns(peer) {
            let _ = self.enqueue(OutboundEvent::QueryInfo { peer });
        }
    }

    /// Starts a connection; `callback` runs once on the reactor thread (or
    /// immediately if the request cannot be queued).
    pub fn connect_with(&self, addr: SocketAddr, data: u32, callback: ConnectCallback) {
        if let Err(OutboundEvent::Connect { callback, .. }) =
            self.enqueue(OutboundEvent::Connect { addr, data, callback })
        {
            callback(PeerId::INVALID);
        }
    }

    /// Connects and blocks until the attempt resolves.
    ///
    /// Must not be called from the reactor thread itself.
    pub fn connect_to(&self, addr: SocketAddr, data: u32) -> PeerId {
        let state = Arc::new((Mutex::new(None::<PeerId>), Condvar::new()));
        let completion = Arc::clone(&state);
        self.connect_with(
            addr,
            data,
            Box::new(move |peer| {
                let (lock, cvar) = &*completion;
                *lock.lock() = Some(peer);
                cvar.notify_all();
            }),
        );

        let (lock, cvar) = &*state;
        let deadline = Instant::now() + self.connect_guard;
        let mut result = lock.lock();
        while result.is_none() {
            if cvar.wait_until(&mut result, deadline).timed_out() {
                error!("Connection to {} never resolved", addr);
                break;
            }
        }
        result.unwrap_or(PeerId::INVALID)
    }
}

/// Owner side of a running reactor.
pub struct Reactor {
    handle: ReactorHandle,
    inbound: channel::Receiver<InboundEvent>,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Binds the endpoint and starts the reactor thread. Failing to bind is
    /// the only fatal transport error.
    pub fn new(config: ReactorConfig) -> Result<Self, TransportError> {
        let max_peers = config.host.max_peers;
        let last_id = u32::try_from(max_peers)
            .ok()
            .and_then(|n| config.base_id.checked_add(n));
        if last_id.map_or(true, |last| last >= PeerId::INVALID.0) {
            return Err(TransportError::IdRange {
                base: config.base_id,
                max_peers,
            });
        }

        let std_socket = std::net::UdpSocket::bind(config.bind).map_err(|source| TransportError::Bind {
            addr: config.bind,
            source,
        })?;
        std_socket.set_nonblocking(true).map_err(TransportError::Socket)?;
        let local_addr = std_socket.local_addr().map_err(TransportError::Socket)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Socket)?;
        let socket = {
            let _guard = runtime.enter();
            UdpSocket::from_std(std_socket).map_err(TransportError::Socket)?
        };

        let (command_tx, command_rx) = mpsc::channel(config.outbound_capacity);
        let (inbound_tx, inbound_rx) = channel::bounded(config.inbound_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = ReactorHandle {
            base_id: config.base_id,
            max_peers,
            connect_guard: config.host.connect_timeout + Duration::from_secs(1),
            commands: command_tx,
        };

        let worker = ReactorLoop {
            base_id: config.base_id,
            host: Host::new(config.host, Instant::now()),
            inbound: inbound_tx,
            backlog: VecDeque::new(),
            pending: HashMap::new(),
        };
        let service_interval = config.service_interval;
        let thread = std::thread::Builder::new()
            .name(format!("reactor-{}", config.base_id))
            .spawn(move || {
                runtime.block_on(worker.run(socket, command_rx, shutdown_rx, service_interval));
            })
            .map_err(TransportError::Thread)?;

        info!(
            "Reactor listening on {} (peers {}..{})",
            local_addr,
            config.base_id,
            config.base_id as usize + max_peers
        );

        Ok(Self {
            handle,
            inbound: inbound_rx,
            local_addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drains the events queued so far and hands them to `handler` on the
    /// calling thread. Returns the number of events processed.
    pub fn poll<H: TransportHandler>(&self, handler: &mut H) -> usize {
        let queued = self.inbound.len();
        let mut processed = 0;
        for _ in 0..queued {
            let Ok(event) = self.inbound.try_recv() else {
                break;
            };
            processed += 1;
            match event {
                InboundEvent::Connect { peer, outgoing, data } => handler.on_connect(peer, outgoing, data),
                InboundEvent::Disconnect { peer, data } => handler.on_disconnect(peer, data),
                InboundEvent::Packet { peer, channel, bytes } => handler.on_packet(peer, channel, bytes),
                InboundEvent::PeerInfo { peer, ping, idle } => handler.on_peer_info(peer, ping, idle),
            }
        }
        processed
    }

    /// Stops the reactor thread, failing pending connects and notifying
    /// connected peers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Reactor thread panicked");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Step {
    Datagram(io::Result<(usize, SocketAddr)>),
    Command(Option<OutboundEvent>),
    Service,
    Shutdown,
}

/// State owned by the reactor thread.
struct ReactorLoop {
    base_id: u32,
    host: Host,
    inbound: channel::Sender<InboundEvent>,
    /// Lifecycle events waiting for room in the inbound queue.
    backlog: VecDeque<InboundEvent>,
    pending: HashMap<usize, ConnectCallback>,
}

impl ReactorLoop {
    async fn run(
        mut self,
        socket: UdpSocket,
        mut commands: mpsc::Receiver<OutboundEvent>,
        mut shutdown: oneshot::Receiver<()>,
        service_interval: Duration,
    ) {
        let mut buffer = [0u8; 2048];
        let mut ticker = tokio::time::interval(service_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                result = socket.recv_from(&mut buffer) => Step::Datagram(result),
                command = commands.recv() => Step::Command(command),
                _ = ticker.tick() => Step::Service,
                _ = &mut shutdown => Step::Shutdown,
            };

            match step {
                Step::Datagram(Ok((len, addr))) => self.host.receive(addr, &buffer[..len], Instant::now()),
                // ICMP errors from closed peers surface here; timeouts handle them.
                Step::Datagram(Err(e)) => debug!("Error receiving datagram: {}", e),
                Step::Command(Some(command)) => self.apply(command),
                Step::Command(None) | Step::Shutdown => break,
                Step::Service => self.host.service(Instant::now()),
            }

            self.flush(&socket).await;
            self.dispatch_events();
        }

        self.host.shutdown();
        self.flush(&socket).await;
        self.dispatch_events();
        for (_, callback) in self.pending.drain() {
            callback(PeerId::INVALID);
        }
        info!("Reactor {} stopped", self.base_id);
    }

    fn peer_id(&self, slot: usize) -> PeerId {
        PeerId::new(self.base_id, slot)
    }

    fn slot(&self, peer: PeerId) -> Option<usize> {
        peer.slot(self.base_id, self.host.capacity())
    }

    fn apply(&mut self, command: OutboundEvent) {
        let now = Instant::now();
        match command {
            OutboundEvent::Connect { addr, data, callback } => match self.host.connect(addr, data, now) {
                Some(slot) => {
                    self.pending.insert(slot, callback);
                }
                None => {
                    warn!("No free slot to connect to {}", addr);
                    callback(PeerId::INVALID);
                }
            },
            OutboundEvent::Disconnect { peer, data, kind } => {
                let Some(slot) = self.slot(peer) else {
                    return;
                };
                match kind {
                    DisconnectKind::Kick => self.host.kick(slot, data),
                    DisconnectKind::Later => self.host.disconnect_later(slot, data, now),
                    DisconnectKind::Normal => self.host.disconnect(slot, data, now),
                }
            }
            OutboundEvent::Packet {
                peer,
                channel,
                delivery,
                bytes,
            } => {
                if let Some(slot) = self.slot(peer) {
                    if !self.host.send(slot, channel, delivery, bytes, now) {
                        debug!("Dropped packet for {}", peer);
                    }
                }
            }
            OutboundEvent::QueryInfo { peer } => {
                let stats = self.slot(peer).and_then(|slot| self.host.stats(slot, now));
                if let Some(stats) = stats {
                    self.enqueue(InboundEvent::PeerInfo {
                        peer,
                        ping: stats.ping,
                        idle: stats.idle,
                    });
                }
            }
        }
    }

    async fn flush(&mut self, socket: &UdpSocket) {
        for (addr, bytes) in self.host.drain_datagrams() {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                debug!("Failed to send datagram to {}: {}", addr, e);
            }
        }
    }

    fn dispatch_events(&mut self) {
        self.retry_backlog();
        while let Some(event) = self.host.next_event() {
            match event {
                HostEvent::Connect { slot, outgoing, data } => {
                    let peer = self.peer_id(slot);
                    if outgoing {
                        if let Some(callback) = self.pending.remove(&slot) {
                            callback(peer);
                        }
                    }
                    info!("{} connected ({})", peer, if outgoing { "outgoing" } else { "incoming" });
                    self.enqueue(InboundEvent::Connect { peer, outgoing, data });
                }
                HostEvent::ConnectFailed { slot } => {
                    if let Some(callback) = self.pending.remove(&slot) {
                        callback(PeerId::INVALID);
                    }
                }
                HostEvent::Disconnect { slot, data } => {
                    let peer = self.peer_id(slot);
                    info!("{} disconnected ({})", peer, data);
                    self.enqueue(InboundEvent::Disconnect { peer, data });
                }
                HostEvent::Receive { slot, channel, payload } => {
                    let peer = self.peer_id(slot);
                    self.enqueue(InboundEvent::Packet {
                        peer,
                        channel,
                        bytes: payload,
                    });
                }
            }
        }
    }

    fn retry_backlog(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            match self.inbound.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.backlog.clear();
                    return;
                }
            }
        }
    }

    fn enqueue(&mut self, event: InboundEvent) {
        if self.backlog.is_empty() {
            match self.inbound.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(event)) => self.hold_or_drop(event),
            }
        } else {
            self.hold_or_drop(event);
        }
    }

    fn hold_or_drop(&mut self, event: InboundEvent) {
        if event.is_lifecycle() {
            self.backlog.push_back(event);
        } else {
            warn!("Inbound queue full, dropping event: {:?}", event);
        }
    }
}
