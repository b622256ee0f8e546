//! Reliable-UDP host state machine
//!
//! The host owns a fixed slot table of peers and turns received datagrams
//! into [`HostEvent`]s and outgoing requests into datagrams. It performs no
//! I/O: the reactor feeds it with `receive`/`service` and drains the
//! produced datagrams and events. Time is always passed in, which keeps the
//! protocol deterministic under test.

use super::frame::Frame;
use log::{debug, info, warn};
use shared::Delivery;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Largest datagram the host emits.
pub const MAX_DATAGRAM: usize = 1400;
/// Upper bound on frame header bytes in front of a payload.
const FRAME_OVERHEAD: usize = 24;
/// Largest payload carried by one datagram.
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_DATAGRAM - FRAME_OVERHEAD;
/// Largest reliable message, in fragments.
pub const MAX_FRAGMENTS: u32 = 1024;

const MIN_RTO: Duration = Duration::from_millis(100);
const MAX_RTO: Duration = Duration::from_secs(1);
const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Timing and capacity parameters of a host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub max_peers: usize,
    pub channel_count: u8,
    pub connect_timeout: Duration,
    pub connect_retry: Duration,
    pub peer_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub ping_interval: Duration,
    /// How far ahead of the next expected reliable sequence a frame may be.
    pub reorder_window: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_peers: 64,
            channel_count: 3,
            connect_timeout: Duration::from_secs(5),
            connect_retry: Duration::from_millis(250),
            peer_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(3),
            ping_interval: Duration::from_secs(1),
            reorder_window: 1024,
        }
    }
}

/// Something the owner of the host must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connect {
        slot: usize,
        outgoing: bool,
        data: u32,
    },
    ConnectFailed {
        slot: usize,
    },
    Disconnect {
        slot: usize,
        data: u32,
    },
    Receive {
        slot: usize,
        channel: u8,
        payload: Vec<u8>,
    },
}

/// Link quality of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    /// Smoothed round-trip time in milliseconds.
    pub ping: u32,
    /// Milliseconds since the last datagram from the peer.
    pub idle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    /// Disconnect once every reliable payload is acknowledged.
    DisconnectLater { data: u32 },
    Disconnecting { data: u32, since: Instant },
}

struct Pending {
    seq: u32,
    frame: Vec<u8>,
    first_sent: Instant,
    last_sent: Instant,
}

struct Fragment {
    index: u32,
    count: u32,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Channel {
    next_reliable_out: u32,
    unacked: VecDeque<Pending>,
    next_reliable_in: u32,
    reorder: BTreeMap<u32, Fragment>,
    assembly: Vec<u8>,
    next_fragment: u32,
    next_unreliable_out: u32,
    last_unreliable_in: Option<u32>,
}

struct Peer {
    addr: SocketAddr,
    token: u32,
    data: u32,
    outgoing: bool,
    state: State,
    channels: Vec<Channel>,
    last_received: Instant,
    last_attempt: Instant,
    last_ping: Instant,
    srtt: Duration,
}

impl Peer {
    fn new(addr: SocketAddr, token: u32, data: u32, outgoing: bool, state: State, channel_count: u8, now: Instant) -> Self {
        Self {
            addr,
            token,
            data,
            outgoing,
            state,
            channels: (0..channel_count).map(|_| Channel::default()).collect(),
            last_received: now,
            last_attempt: now,
            last_ping: now,
            srtt: INITIAL_RTT,
        }
    }

    fn is_established(&self) -> bool {
        matches!(self.state, State::Connected | State::DisconnectLater { .. })
    }

    fn all_acked(&self) -> bool {
        self.channels.iter().all(|c| c.unacked.is_empty())
    }

    fn rto(&self) -> Duration {
        (self.srtt * 2).clamp(MIN_RTO, MAX_RTO)
    }
}

/// True when `seq` comes after `last` in wrapping sequence order.
fn is_newer(seq: u32, last: u32) -> bool {
    (seq.wrapping_sub(last) as i32) > 0
}

fn push_frame(datagrams: &mut Vec<(SocketAddr, Vec<u8>)>, addr: SocketAddr, frame: &Frame) {
    match frame.encode() {
        Ok(bytes) => datagrams.push((addr, bytes)),
        Err(e) => warn!("Failed to encode frame for {}: {}", addr, e),
    }
}

/// Reliable-UDP host over a fixed slot table.
pub struct Host {
    config: HostConfig,
    slots: Vec<Option<Peer>>,
    by_addr: HashMap<SocketAddr, usize>,
    epoch: Instant,
    datagrams: Vec<(SocketAddr, Vec<u8>)>,
    events: VecDeque<HostEvent>,
}

impl Host {
    pub fn new(config: HostConfig, now: Instant) -> Self {
        let slots = (0..config.max_peers).map(|_| None).collect();
        Self {
            config,
            slots,
            by_addr: HashMap::new(),
            epoch: now,
            datagrams: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots, including peers still handshaking.
    pub fn peer_count(&self) -> usize {
        self.slots.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_connected(&self, slot: usize) -> bool {
        self.peer(slot).map_or(false, Peer::is_established)
    }

    pub fn peer_addr(&self, slot: usize) -> Option<SocketAddr> {
        self.peer(slot).map(|p| p.addr)
    }

    /// Datagrams produced since the last call.
    pub fn drain_datagrams(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.datagrams)
    }

    pub fn next_event(&mut self) -> Option<HostEvent> {
        self.events.pop_front()
    }

    fn peer(&self, slot: usize) -> Option<&Peer> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn millis(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Starts a handshake with `addr`. Returns the reserved slot, or `None`
    /// when the table is full or the address already has a slot.
    pub fn connect(&mut self, addr: SocketAddr, data: u32, now: Instant) -> Option<usize> {
        if self.by_addr.contains_key(&addr) {
            warn!("Already have a peer at {}", addr);
            return None;
        }
        let slot = self.free_slot()?;
        let token = rand::random::<u32>();
        let peer = Peer::new(addr, token, data, true, State::Connecting, self.config.channel_count, now);
        self.slots[slot] = Some(peer);
        self.by_addr.insert(addr, slot);
        push_frame(&mut self.datagrams, addr, &Frame::Connect { token, data });
        debug!("Connecting to {} on slot {}", addr, slot);
        Some(slot)
    }

    /// Queues a payload. Returns false when it was dropped.
    pub fn send(&mut self, slot: usize, channel: u8, delivery: Delivery, payload: Vec<u8>, now: Instant) -> bool {
        let Some(peer) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return false;
        };
        if peer.state != State::Connected {
            return false;
        }
        let addr = peer.addr;
        let Some(ch) = peer.channels.get_mut(channel as usize) else {
            warn!("Dropping payload for {} on unknown channel {}", addr, channel);
            return false;
        };

        match delivery {
            Delivery::Reliable => {
                let count = payload.len().div_ceil(MAX_FRAGMENT_PAYLOAD).max(1);
                if count > MAX_FRAGMENTS as usize {
                    warn!("Dropping {} byte reliable payload for {}: too large", payload.len(), addr);
                    return false;
                }
                let mut chunks: Vec<&[u8]> = payload.chunks(MAX_FRAGMENT_PAYLOAD).collect();
                if chunks.is_empty() {
                    chunks.push(&[]);
                }
                for (index, chunk) in chunks.into_iter().enumerate() {
                    let seq = ch.next_reliable_out;
                    ch.next_reliable_out = seq.wrapping_add(1);
                    let frame = Frame::Reliable {
                        channel,
                        seq,
                        fragment: index as u32,
                        fragment_count: count as u32,
                        payload: chunk.to_vec(),
                    };
                    let bytes = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("Failed to encode reliable frame for {}: {}", addr, e);
                            return false;
                        }
                    };
                    self.datagrams.push((addr, bytes.clone()));
                    ch.unacked.push_back(Pending {
                        seq,
                        frame: bytes,
                        first_sent: now,
                        last_sent: now,
                    });
                }
                true
            }
            Delivery::Unreliable | Delivery::Unordered => {
                if payload.len() > MAX_FRAGMENT_PAYLOAD {
                    warn!(
                        "Dropping {} byte {:?} payload for {}: exceeds one datagram",
                        payload.len(),
                        delivery,
                        addr
                    );
                    return false;
                }
                let frame = if delivery == Delivery::Unreliable {
                    let seq = ch.next_unreliable_out;
                    ch.next_unreliable_out = seq.wrapping_add(1);
                    Frame::Unreliable { channel, seq, payload }
                } else {
                    Frame::Unordered { channel, payload }
                };
                push_frame(&mut self.datagrams, addr, &frame);
                true
            }
        }
    }

    /// Graceful close: the slot is freed once the peer acknowledges or the
    /// disconnect timeout elapses.
    pub fn disconnect(&mut self, slot: usize, data: u32, now: Instant) {
        let Some(peer) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        match peer.state {
            State::Connecting => {
                push_frame(&mut self.datagrams, peer.addr, &Frame::Disconnect { data });
                self.release(slot, data);
            }
            State::Connected | State::DisconnectLater { .. } => {
                peer.state = State::Disconnecting { data, since: now };
                peer.last_attempt = now;
                push_frame(&mut self.datagrams, peer.addr, &Frame::Disconnect { data });
            }
            State::Disconnecting { .. } => {}
        }
    }

    /// Close once queued reliable payloads are acknowledged.
    pub fn disconnect_later(&mut self, slot: usize, data: u32, now: Instant) {
        let Some(peer) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        if peer.state == State::Connected && !peer.all_acked() {
            peer.state = State::DisconnectLater { data };
        } else {
            self.disconnect(slot, data, now);
        }
    }

    /// Frees the slot immediately and reports the disconnect locally.
    pub fn kick(&mut self, slot: usize, data: u32) {
        let Some(peer) = self.peer(slot) else {
            return;
        };
        let addr = peer.addr;
        push_frame(&mut self.datagrams, addr, &Frame::Disconnect { data });
        self.release(slot, data);
    }

    pub fn stats(&self, slot: usize, now: Instant) -> Option<PeerStats> {
        let peer = self.peer(slot)?;
        Some(PeerStats {
            ping: peer.srtt.as_millis() as u32,
            idle: now.saturating_duration_since(peer.last_received).as_millis() as u32,
        })
    }

    /// Drops every peer: pending handshakes fail, established peers are
    /// notified best-effort and reported disconnected.
    pub fn shutdown(&mut self) {
        for slot in 0..self.slots.len() {
            if self.slots[slot].is_some() {
                self.kick(slot, 0);
            }
        }
    }

    /// Frees a slot and emits the event matching how far the peer got.
    fn release(&mut self, slot: usize, data: u32) {
        let Some(peer) = self.slots.get_mut(slot).and_then(Option::take) else {
            return;
        };
        self.by_addr.remove(&peer.addr);
        if peer.state == State::Connecting {
            self.events.push_back(HostEvent::ConnectFailed { slot });
        } else {
            self.events.push_back(HostEvent::Disconnect { slot, data });
        }
    }

    /// Processes one datagram from `from`.
    pub fn receive(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring malformed datagram from {}: {}", from, e);
                return;
            }
        };

        let Some(&slot) = self.by_addr.get(&from) else {
            self.receive_unknown(from, frame, now);
            return;
        };
        if let Some(peer) = self.slots[slot].as_mut() {
            peer.last_received = now;
        }

        match frame {
            Frame::Connect { token, data } => {
                let Some(peer) = self.slots[slot].as_ref() else {
                    return;
                };
                if peer.outgoing {
                    return;
                }
                if peer.token == token {
                    push_frame(&mut self.datagrams, from, &Frame::Accept { token });
                } else {
                    info!("Peer at {} reconnected, dropping old session", from);
                    self.release(slot, 0);
                    self.receive_unknown(from, Frame::Connect { token, data }, now);
                }
            }
            Frame::Accept { token } => {
                let Some(peer) = self.slots[slot].as_mut() else {
                    return;
                };
                if peer.state == State::Connecting && peer.token == token {
                    peer.state = State::Connected;
                    peer.last_ping = now;
                    let data = peer.data;
                    self.events.push_back(HostEvent::Connect {
                        slot,
                        outgoing: true,
                        data,
                    });
                }
            }
            Frame::Refuse { token } => {
                let matches = self.slots[slot]
                    .as_ref()
                    .map_or(false, |p| p.state == State::Connecting && p.token == token);
                if matches {
                    info!("Connection to {} refused", from);
                    self.release(slot, 0);
                }
            }
            Frame::Disconnect { data } => {
                push_frame(&mut self.datagrams, from, &Frame::DisconnectAck);
                self.release(slot, data);
            }
            Frame::DisconnectAck => {
                if let Some(State::Disconnecting { data, .. }) = self.slots[slot].as_ref().map(|p| p.state) {
                    self.release(slot, data);
                }
            }
            Frame::Ping { time } => {
                push_frame(&mut self.datagrams, from, &Frame::Pong { time });
            }
            Frame::Pong { time } => {
                let sample = Duration::from_millis(u64::from(self.millis(now).wrapping_sub(time)));
                if let Some(peer) = self.slots[slot].as_mut() {
                    peer.srtt = (peer.srtt * 7 + sample) / 8;
                }
            }
            Frame::Reliable {
                channel,
                seq,
                fragment,
                fragment_count,
                payload,
            } => self.receive_reliable(
                slot,
                channel,
                seq,
                Fragment {
                    index: fragment,
                    count: fragment_count,
                    payload,
                },
            ),
            Frame::Unreliable { channel, seq, payload } => {
                let Some(peer) = self.slots[slot].as_mut() else {
                    return;
                };
                if !peer.is_established() {
                    return;
                }
                let Some(ch) = peer.channels.get_mut(channel as usize) else {
                    return;
                };
                if ch.last_unreliable_in.map_or(true, |last| is_newer(seq, last)) {
                    ch.last_unreliable_in = Some(seq);
                    self.events.push_back(HostEvent::Receive { slot, channel, payload });
                }
            }
            Frame::Unordered { channel, payload } => {
                let deliver = self.slots[slot]
                    .as_ref()
                    .map_or(false, |p| p.is_established() && (channel as usize) < p.channels.len());
                if deliver {
                    self.events.push_back(HostEvent::Receive { slot, channel, payload });
                }
            }
            Frame::Ack { channel, seq } => {
                let Some(peer) = self.slots[slot].as_mut() else {
                    return;
                };
                if let Some(ch) = peer.channels.get_mut(channel as usize) {
                    ch.unacked.retain(|p| p.seq != seq);
                }
                if let State::DisconnectLater { data } = peer.state {
                    if peer.all_acked() {
                        self.disconnect(slot, data, now);
                    }
                }
            }
        }
    }

    fn receive_unknown(&mut self, from: SocketAddr, frame: Frame, now: Instant) {
        match frame {
            Frame::Connect { token, data } => match self.free_slot() {
                Some(slot) => {
                    let peer = Peer::new(from, token, data, false, State::Connected, self.config.channel_count, now);
                    self.slots[slot] = Some(peer);
                    self.by_addr.insert(from, slot);
                    push_frame(&mut self.datagrams, from, &Frame::Accept { token });
                    self.events.push_back(HostEvent::Connect {
                        slot,
                        outgoing: false,
                        data,
                    });
                }
                None => {
                    warn!("Refusing connection from {}: host full", from);
                    push_frame(&mut self.datagrams, from, &Frame::Refuse { token });
                }
            },
            Frame::Disconnect { .. } => {
                push_frame(&mut self.datagrams, from, &Frame::DisconnectAck);
            }
            _ => {}
        }
    }

    fn receive_reliable(&mut self, slot: usize, channel: u8, seq: u32, fragment: Fragment) {
        let window = self.config.reorder_window;
        let Some(peer) = self.slots[slot].as_mut() else {
            return;
        };
        if !peer.is_established() {
            return;
        }
        let addr = peer.addr;
        let Some(ch) = peer.channels.get_mut(channel as usize) else {
            return;
        };
        if fragment.count == 0 || fragment.count > MAX_FRAGMENTS || fragment.index >= fragment.count {
            warn!("Dropping malformed reliable fragment from {}", addr);
            return;
        }

        let offset = seq.wrapping_sub(ch.next_reliable_in);
        if offset >= window {
            // Already delivered: the ack was lost, so acknowledge again.
            if offset > u32::MAX - window {
                push_frame(&mut self.datagrams, addr, &Frame::Ack { channel, seq });
            }
            return;
        }
        push_frame(&mut self.datagrams, addr, &Frame::Ack { channel, seq });
        ch.reorder.entry(seq).or_insert(fragment);

        while let Some(next) = ch.reorder.remove(&ch.next_reliable_in) {
            ch.next_reliable_in = ch.next_reliable_in.wrapping_add(1);
            if next.index != ch.next_fragment {
                warn!("Discarding out-of-sequence fragment from {}", addr);
                ch.assembly.clear();
                ch.next_fragment = 0;
                continue;
            }
            ch.assembly.extend_from_slice(&next.payload);
            if next.index + 1 == next.count {
                let payload = std::mem::take(&mut ch.assembly);
                ch.next_fragment = 0;
                self.events.push_back(HostEvent::Receive { slot, channel, payload });
            } else {
                ch.next_fragment += 1;
            }
        }
    }

    /// Drives timers: handshake and disconnect retries, retransmission,
    /// keep-alive pings and timeouts.
    pub fn service(&mut self, now: Instant) {
        let time = self.millis(now);
        for slot in 0..self.slots.len() {
            let Some(peer) = self.slots[slot].as_mut() else {
                continue;
            };
            match peer.state {
                State::Connecting => {
                    if now.saturating_duration_since(peer.last_received) >= self.config.connect_timeout {
                        info!("Connection attempt to {} timed out", peer.addr);
                        self.release(slot, 0);
                    } else if now.saturating_duration_since(peer.last_attempt) >= self.config.connect_retry {
                        peer.last_attempt = now;
                        let frame = Frame::Connect {
                            token: peer.token,
                            data: peer.data,
                        };
                        push_frame(&mut self.datagrams, peer.addr, &frame);
                    }
                }
                State::Disconnecting { data, since } => {
                    if now.saturating_duration_since(since) >= self.config.disconnect_timeout {
                        debug!("No disconnect acknowledgement from {}", peer.addr);
                        self.release(slot, data);
                    } else if now.saturating_duration_since(peer.last_attempt) >= self.config.connect_retry {
                        peer.last_attempt = now;
                        push_frame(&mut self.datagrams, peer.addr, &Frame::Disconnect { data });
                    }
                }
                State::Connected | State::DisconnectLater { .. } => {
                    if now.saturating_duration_since(peer.last_received) >= self.config.peer_timeout {
                        warn!("Peer {} timed out", peer.addr);
                        self.release(slot, 0);
                        continue;
                    }

                    let rto = peer.rto();
                    let mut stalled = false;
                    for ch in &mut peer.channels {
                        for pending in &mut ch.unacked {
                            if now.saturating_duration_since(pending.first_sent) >= self.config.peer_timeout {
                                stalled = true;
                                break;
                            }
                            if now.saturating_duration_since(pending.last_sent) >= rto {
                                pending.last_sent = now;
                                self.datagrams.push((peer.addr, pending.frame.clone()));
                            }
                        }
                    }
                    if stalled {
                        warn!("Reliable delivery to {} stalled", peer.addr);
                        self.release(slot, 0);
                        continue;
                    }

                    if now.saturating_duration_since(peer.last_ping) >= self.config.ping_interval {
                        peer.last_ping = now;
                        push_frame(&mut self.datagrams, peer.addr, &Frame::Ping { time });
                    }

                    if let State::DisconnectLater { data } = peer.state {
                        if peer.all_acked() {
                            self.disconnect(slot, data, now);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_unreliable_sequence_order_wraps() {
        assert!(is_newer(2, 1));
        assert!(!is_newer(1, 1));
        assert!(!is_newer(1, 2));
        assert!(is_newer(0, u32::MAX));
        assert!(is_newer(5, u32::MAX - 5));
        assert!(!is_newer(u32::MAX, 0));
    }

    fn config(max_peers: usize) -> HostConfig {
        HostConfig {
            max_peers,
            ..HostConfig::default()
        }
    }

    /// Two hosts wired back to back with optional datagram filtering.
    struct Link {
        a: Host,
        b: Host,
        a_addr: SocketAddr,
        b_addr: SocketAddr,
        now: Instant,
    }

    impl Link {
        fn new() -> Self {
            let now = Instant::now();
            Self {
                a: Host::new(config(4), now),
                b: Host::new(config(4), now),
                a_addr: addr(4000),
                b_addr: addr(5000),
                now,
            }
        }

        fn advance(&mut self, ms: u64) {
            self.now += Duration::from_millis(ms);
            self.a.service(self.now);
            self.b.service(self.now);
        }

        /// Delivers queued datagrams in both directions, dropping those
        /// rejected by `keep`.
        fn pump_filtered(&mut self, mut keep: impl FnMut(&[u8]) -> bool) {
            for _ in 0..16 {
                let from_a = self.a.drain_datagrams();
                let from_b = self.b.drain_datagrams();
                if from_a.is_empty() && from_b.is_empty() {
                    return;
                }
                for (to, bytes) in from_a {
                    if to == self.b_addr && keep(&bytes) {
                        self.b.receive(self.a_addr, &bytes, self.now);
                    }
                }
                for (to, bytes) in from_b {
                    if to == self.a_addr && keep(&bytes) {
                        self.a.receive(self.b_addr, &bytes, self.now);
                    }
                }
            }
        }

        fn pump(&mut self) {
            self.pump_filtered(|_| true);
        }

        fn connected() -> (Self, usize, usize) {
            let mut link = Self::new();
            let a_slot = link.a.connect(link.b_addr, 7, link.now).unwrap();
            link.pump();
            let a_events = events(&mut link.a);
            let b_events = events(&mut link.b);
            assert_eq!(
                a_events,
                vec![HostEvent::Connect {
                    slot: a_slot,
                    outgoing: true,
                    data: 7
                }]
            );
            let b_slot = match b_events.as_slice() {
                [HostEvent::Connect { slot, outgoing: false, data: 7 }] => *slot,
                other => panic!("unexpected events {:?}", other),
            };
            (link, a_slot, b_slot)
        }
    }

    fn events(host: &mut Host) -> Vec<HostEvent> {
        std::iter::from_fn(|| host.next_event()).collect()
    }

    fn received(host: &mut Host) -> Vec<Vec<u8>> {
        events(host)
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::Receive { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    fn disconnects(events: &[HostEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, HostEvent::Disconnect { .. }))
            .count()
    }

    #[test]
    fn test_handshake() {
        let (link, a_slot, b_slot) = Link::connected();
        assert!(link.a.is_connected(a_slot));
        assert!(link.b.is_connected(b_slot));
        assert_eq!(link.b.peer_addr(b_slot), Some(link.a_addr));
    }

    #[test]
    fn test_reliable_in_order_despite_loss() {
        let (mut link, a_slot, _) = Link::connected();
        for i in 0..5u8 {
            assert!(link.a.send(a_slot, 1, Delivery::Reliable, vec![i], link.now));
        }

        // Lose the second payload on first transmission.
        let mut seen = 0;
        link.pump_filtered(|bytes| {
            if matches!(Frame::decode(bytes), Ok(Frame::Reliable { seq: 1, .. })) {
                seen += 1;
                return seen > 1;
            }
            true
        });
        assert_eq!(received(&mut link.b), vec![vec![0]]);

        link.advance(250);
        link.pump();
        assert_eq!(received(&mut link.b), vec![vec![1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_duplicate_reliable_is_delivered_once() {
        let (mut link, a_slot, _) = Link::connected();
        link.a.send(a_slot, 0, Delivery::Reliable, b"hello".to_vec(), link.now);
        let datagrams = link.a.drain_datagrams();
        for (_, bytes) in &datagrams {
            link.b.receive(link.a_addr, bytes, link.now);
            link.b.receive(link.a_addr, bytes, link.now);
        }
        assert_eq!(received(&mut link.b), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_large_reliable_payload_is_fragmented() {
        let (mut link, a_slot, _) = Link::connected();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        link.a.send(a_slot, 1, Delivery::Reliable, payload.clone(), link.now);
        assert!(link.a.datagrams.iter().all(|(_, d)| d.len() <= MAX_DATAGRAM));
        link.pump();
        assert_eq!(received(&mut link.b), vec![payload]);
    }

    #[test]
    fn test_stale_unreliable_dropped() {
        let (mut link, a_slot, _) = Link::connected();
        link.a.send(a_slot, 2, Delivery::Unreliable, vec![1], link.now);
        link.a.send(a_slot, 2, Delivery::Unreliable, vec![2], link.now);
        let mut datagrams = link.a.drain_datagrams();
        datagrams.reverse();
        for (_, bytes) in datagrams {
            link.b.receive(link.a_addr, &bytes, link.now);
        }
        assert_eq!(received(&mut link.b), vec![vec![2]]);
    }

    #[test]
    fn test_oversized_unordered_dropped() {
        let (mut link, a_slot, _) = Link::connected();
        assert!(!link.a.send(a_slot, 0, Delivery::Unordered, vec![0; MAX_DATAGRAM], link.now));
        assert!(link.a.send(a_slot, 0, Delivery::Unordered, vec![0; 16], link.now));
    }

    #[test]
    fn test_send_to_empty_slot_dropped() {
        let mut link = Link::new();
        assert!(!link.a.send(3, 0, Delivery::Reliable, vec![1], link.now));
        assert!(link.a.drain_datagrams().is_empty());
    }

    #[test]
    fn test_kick_reports_disconnect_once_on_both_sides() {
        let (mut link, a_slot, _) = Link::connected();
        link.a.kick(a_slot, 9);
        assert!(!link.a.is_connected(a_slot));
        link.pump();
        link.advance(10_000);
        link.pump();

        let a_events = events(&mut link.a);
        let b_events = events(&mut link.b);
        assert_eq!(a_events, vec![HostEvent::Disconnect { slot: a_slot, data: 9 }]);
        assert_eq!(disconnects(&b_events), 1);
        assert!(b_events.contains(&HostEvent::Disconnect { slot: 0, data: 9 }));
    }

    #[test]
    fn test_graceful_disconnect() {
        let (mut link, a_slot, b_slot) = Link::connected();
        link.a.disconnect(a_slot, 3, link.now);
        assert_eq!(link.a.peer_count(), 1);
        link.pump();
        assert_eq!(events(&mut link.a), vec![HostEvent::Disconnect { slot: a_slot, data: 3 }]);
        assert_eq!(events(&mut link.b), vec![HostEvent::Disconnect { slot: b_slot, data: 3 }]);
        assert_eq!(link.a.peer_count(), 0);
        assert_eq!(link.b.peer_count(), 0);
    }

    #[test]
    fn test_graceful_disconnect_without_ack_times_out() {
        let (mut link, a_slot, _) = Link::connected();
        link.a.disconnect(a_slot, 0, link.now);
        link.a.drain_datagrams();
        link.now += Duration::from_secs(4);
        link.a.service(link.now);
        assert_eq!(events(&mut link.a), vec![HostEvent::Disconnect { slot: a_slot, data: 0 }]);
    }

    #[test]
    fn test_disconnect_later_waits_for_acks() {
        let (mut link, a_slot, b_slot) = Link::connected();
        link.a.send(a_slot, 1, Delivery::Reliable, vec![42], link.now);
        link.a.disconnect_later(a_slot, 5, link.now);

        // Nothing leaves before the payload is acknowledged.
        let datagrams = link.a.drain_datagrams();
        assert!(datagrams
            .iter()
            .all(|(_, d)| !matches!(Frame::decode(d), Ok(Frame::Disconnect { .. }))));
        for (_, bytes) in datagrams {
            link.b.receive(link.a_addr, &bytes, link.now);
        }
        link.pump();

        let b_events = events(&mut link.b);
        assert_eq!(
            b_events,
            vec![
                HostEvent::Receive {
                    slot: b_slot,
                    channel: 1,
                    payload: vec![42]
                },
                HostEvent::Disconnect { slot: b_slot, data: 5 },
            ]
        );
        assert_eq!(events(&mut link.a), vec![HostEvent::Disconnect { slot: a_slot, data: 5 }]);
    }

    #[test]
    fn test_silent_peer_times_out_once() {
        let (mut link, a_slot, _) = Link::connected();
        for _ in 0..12 {
            link.now += Duration::from_millis(500);
            link.a.service(link.now);
            link.a.drain_datagrams();
        }
        let a_events = events(&mut link.a);
        assert_eq!(a_events, vec![HostEvent::Disconnect { slot: a_slot, data: 0 }]);
    }

    #[test]
    fn test_connect_to_full_host_is_refused() {
        let now = Instant::now();
        let mut server = Host::new(config(1), now);
        let mut first = Host::new(config(1), now);
        let mut second = Host::new(config(1), now);
        let server_addr = addr(6000);

        first.connect(server_addr, 0, now).unwrap();
        for (_, bytes) in first.drain_datagrams() {
            server.receive(addr(6001), &bytes, now);
        }
        server.drain_datagrams();

        let slot = second.connect(server_addr, 0, now).unwrap();
        for (_, bytes) in second.drain_datagrams() {
            server.receive(addr(6002), &bytes, now);
        }
        for (_, bytes) in server.drain_datagrams() {
            second.receive(server_addr, &bytes, now);
        }
        assert_eq!(events(&mut second), vec![HostEvent::ConnectFailed { slot }]);
        assert_eq!(second.peer_count(), 0);
    }

    #[test]
    fn test_unanswered_connect_fails_after_timeout() {
        let mut link = Link::new();
        let slot = link.a.connect(link.b_addr, 0, link.now).unwrap();
        let mut attempts = 1;
        for _ in 0..24 {
            link.now += Duration::from_millis(250);
            link.a.service(link.now);
            attempts += link.a.drain_datagrams().len();
        }
        assert!(attempts > 10);
        assert_eq!(events(&mut link.a), vec![HostEvent::ConnectFailed { slot }]);
    }

    #[test]
    fn test_ping_updates_rtt() {
        let (mut link, a_slot, _) = Link::connected();
        link.now += Duration::from_secs(1);
        link.a.service(link.now);
        let pings = link.a.drain_datagrams();
        assert_eq!(pings.len(), 1);
        for (_, bytes) in pings {
            link.b.receive(link.a_addr, &bytes, link.now);
        }
        link.now += Duration::from_millis(20);
        for (_, bytes) in link.b.drain_datagrams() {
            link.a.receive(link.b_addr, &bytes, link.now);
        }
        let stats = link.a.stats(a_slot, link.now).unwrap();
        assert!(stats.ping < 100);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_shutdown_fails_pending_and_disconnects_established() {
        let (mut link, a_slot, _) = Link::connected();
        let pending = link.a.connect(addr(7000), 0, link.now).unwrap();
        link.a.shutdown();
        let a_events = events(&mut link.a);
        assert!(a_events.contains(&HostEvent::Disconnect { slot: a_slot, data: 0 }));
        assert!(a_events.contains(&HostEvent::ConnectFailed { slot: pending }));
        assert_eq!(link.a.peer_count(), 0);
    }
}
