use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::error::ConnectionError;
use super::events::{ProtocolEvent, ResyncReason};
use super::message::MessageKind;
use super::protocol::{Packet, PacketHeader, PacketView, PAYLOAD_CAPACITY};
use super::queue::{MessageQueue, QueueError};
use super::reassembly::{Delivery, Reassembler};
use super::retransmit::{LostPacket, RetransmitPolicy};
use super::stats::NetworkStats;
use super::tracking::{AckFold, AckTracker, ReceiveTracker, Received};
use super::window::window_index;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    None,
    TryingAuth,
    Auth,
    InGame,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::None => "none",
            ConnectionState::TryingAuth => "trying auth",
            ConnectionState::Auth => "auth",
            ConnectionState::InGame => "in game",
        }
    }
}

/// Protocol engine for one peer, shared by both roles.
///
/// A tick calls [`check_window`](Self::check_window) before anything is
/// received, then [`process`](Self::process) for every datagram from the peer,
/// and finally [`build_packet`](Self::build_packet) once.
#[derive(Debug)]
pub struct Connection {
    addr: SocketAddr,
    state: ConnectionState,
    acks: AckTracker,
    received: ReceiveTracker,
    retransmit: RetransmitPolicy,
    queue: MessageQueue,
    reassembler: Reassembler,
    stats: NetworkStats,
    events: Vec<ProtocolEvent>,
    created_at: Instant,
    last_receive_time: Instant,
    last_send_time: Option<Instant>,
}

impl Connection {
    pub fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            state: ConnectionState::None,
            acks: AckTracker::new(),
            received: ReceiveTracker::new(),
            retransmit: RetransmitPolicy::new(),
            queue: MessageQueue::new(),
            reassembler: Reassembler::new(),
            stats: NetworkStats::default(),
            events: Vec::new(),
            created_at: now,
            last_receive_time: now,
            last_send_time: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        log::info!("{}: {} -> {}", self.addr, from.as_str(), to.as_str());
        self.state = to;
        self.events.push(ProtocolEvent::StateChanged { from, to });
    }

    /// Resolves the packet sent one window before the next outgoing sequence.
    pub fn check_window(&mut self) -> Option<LostPacket> {
        let next = self.acks.sequence().wrapping_add(1);
        let lost = self.retransmit.check_window(
            next,
            self.acks.acked(),
            &mut self.queue,
            &mut self.events,
        )?;

        self.stats.packets_lost += 1;
        self.stats.messages_requeued += lost.requeued as u64;
        self.stats.messages_dropped += lost.dropped as u64;
        self.stats.update_loss_percent();
        Some(lost)
    }

    /// Folds a decoded packet from the peer into both windows and returns
    /// the payloads it completed. Duplicate and stale packets are ignored.
    pub fn process(&mut self, packet: &PacketView<'_>, len: usize, now: Instant) -> Vec<Delivery> {
        let header = &packet.header;

        match self.received.record(header.sequence) {
            Received::Duplicate | Received::Stale => {
                log::debug!("{}: ignoring old packet {}", self.addr, header.sequence);
                self.stats.packets_duplicate += 1;
                return Vec::new();
            }
            Received::Resync { gap } => {
                log::debug!("{}: receive window resync, gap {gap}", self.addr);
                self.events
                    .push(ProtocolEvent::WindowResync(ResyncReason::ReceiveGap { gap }));
            }
            Received::New | Received::Late => {}
        }

        self.touch(now);
        self.stats.packets_received += 1;
        self.stats.bytes_received += len as u64;

        self.fold_ack(header, now);

        let mut deliveries = Vec::new();
        for message in &packet.messages {
            self.stats.messages_received += 1;
            if let Some(delivery) = self.reassembler.accept(message) {
                deliveries.push(delivery);
            }
        }
        deliveries
    }

    fn fold_ack(&mut self, header: &PacketHeader, now: Instant) {
        match self.acks.fold_ack(header.ack, header.ack_bitfield, now) {
            AckFold::Applied { newly_acked } => {
                let delivered =
                    self.retransmit
                        .on_acked(newly_acked, &mut self.queue, &mut self.events);
                self.stats.messages_delivered += delivered as u64;
                self.stats.rtt_ms = self.acks.srtt();
                self.stats.rtt_variance = self.acks.rtt_var();
            }
            AckFold::Desync { gap } => {
                log::debug!("{}: ack {} is {gap} behind, window reset", self.addr, header.ack);
                self.events
                    .push(ProtocolEvent::WindowResync(ResyncReason::AckDesync { gap }));
            }
            AckFold::Ahead => {
                log::debug!(
                    "{}: ack {} ahead of our sequence {}",
                    self.addr,
                    header.ack,
                    self.acks.sequence()
                );
                self.events
                    .push(ProtocolEvent::WindowResync(ResyncReason::AckAhead {
                        ack: header.ack,
                        sequence: self.acks.sequence(),
                    }));
            }
            AckFold::Stale => {}
        }
    }

    pub fn enqueue(
        &mut self,
        kind: MessageKind,
        critical: bool,
        payload: &[u8],
    ) -> Result<u8, QueueError> {
        self.queue
            .enqueue_fragmented(kind, critical, payload, self.acks.acked())
    }

    /// Takes the next sequence number and drains as many queued messages as
    /// fit into one packet.
    pub fn build_packet(&mut self, now: Instant) -> Packet {
        let sequence = self.acks.next_sequence(now);
        let (ack, ack_bitfield) = self.received.ack_data();

        let messages: Vec<_> = self
            .queue
            .drain_for_packet(PAYLOAD_CAPACITY, window_index(sequence) as u8)
            .collect();
        let critical = messages.iter().any(|m| m.critical);
        self.retransmit.on_sent(sequence, critical);

        let mut header = PacketHeader::new(sequence, ack, ack_bitfield);
        header.message_count = messages.len() as u16;

        self.stats.messages_sent += messages.len() as u64;
        self.last_send_time = Some(now);
        Packet::new(header, messages)
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
        self.stats.update_loss_percent();
    }

    pub fn record_send_error(&mut self) {
        self.stats.send_errors += 1;
    }

    pub fn record_malformed(&mut self) {
        self.stats.packets_malformed += 1;
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_receive_time) > timeout
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive_time = now;
    }

    pub fn drain_events(&mut self) -> Vec<ProtocolEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn acks(&self) -> &AckTracker {
        &self.acks
    }

    pub fn receive_tracker(&self) -> &ReceiveTracker {
        &self.received
    }

    pub fn retransmit(&self) -> &RetransmitPolicy {
        &self.retransmit
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_receive_time(&self) -> Instant {
        self.last_receive_time
    }

    pub fn last_send_time(&self) -> Option<Instant> {
        self.last_send_time
    }
}

#[derive(Debug)]
pub struct ConnectionManager {
    connections: HashMap<SocketAddr, Connection>,
    max_connections: usize,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self::with_timeout(max_connections, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(max_connections: usize, timeout: Duration) -> Self {
        Self {
            connections: HashMap::with_capacity(max_connections),
            max_connections,
            timeout,
        }
    }

    /// Returns the connection for `addr`, creating it if there is room. The
    /// flag is true when the connection was just created.
    pub fn get_or_create(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(&mut Connection, bool), ConnectionError> {
        let len = self.connections.len();
        match self.connections.entry(addr) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(_) if len >= self.max_connections => Err(ConnectionError::Full {
                max: self.max_connections,
            }),
            Entry::Vacant(entry) => Ok((entry.insert(Connection::new(addr, now)), true)),
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.connections.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(addr)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Connection> {
        self.connections.remove(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Removes and returns every connection silent for longer than the
    /// timeout.
    pub fn cleanup_timed_out(&mut self, now: Instant) -> Vec<Connection> {
        let timed_out: Vec<SocketAddr> = self
            .connections
            .values()
            .filter(|conn| conn.is_timed_out(now, self.timeout))
            .map(Connection::addr)
            .collect();

        timed_out
            .iter()
            .filter_map(|addr| self.connections.remove(addr))
            .collect()
    }

    pub fn count_in_state(&self, state: ConnectionState) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.state() == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
