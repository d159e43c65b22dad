use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::{Connection, ConnectionManager, ConnectionState, DEFAULT_TIMEOUT};
use super::error::{ConnectionError, ProtocolError};
use super::events::HostEvent;
use super::message::{AuthPayload, MessageKind};
use super::protocol::{Packet, MAX_PACKET_SIZE};
use super::reassembly::Delivery;
use super::stats::NetworkStats;
use super::transport::{Transport, UdpTransport};

pub const DEFAULT_HOST_SEND_RATE: u32 = 10;
pub const DEFAULT_MAX_CLIENTS: usize = 192;
pub const CHECKING_CREDENTIALS: &[u8] = b"Checking credentials";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Packets per second sent to every peer; one per tick.
    pub send_rate: u32,
    pub max_clients: usize,
    pub timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            send_rate: DEFAULT_HOST_SEND_RATE,
            max_clients: DEFAULT_MAX_CLIENTS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Decides whether a peer's credentials are accepted.
pub trait Authenticator {
    fn authenticate(&mut self, addr: SocketAddr, credentials: &AuthPayload) -> bool;
}

impl<F> Authenticator for F
where
    F: FnMut(SocketAddr, &AuthPayload) -> bool,
{
    fn authenticate(&mut self, addr: SocketAddr, credentials: &AuthPayload) -> bool {
        self(addr, credentials)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Authenticator for AcceptAll {
    fn authenticate(&mut self, _addr: SocketAddr, _credentials: &AuthPayload) -> bool {
        true
    }
}

/// Server role: one [`Connection`] per peer address, created on the first
/// valid packet and dropped after the timeout.
pub struct Host<T, A = AcceptAll> {
    transport: T,
    config: HostConfig,
    connections: ConnectionManager,
    authenticator: A,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    running: Arc<AtomicBool>,
    pending_events: VecDeque<HostEvent>,
    /// Last time each turned-away address was reported.
    rejected_at: HashMap<SocketAddr, Instant>,
    retired_stats: NetworkStats,
    unattributed_malformed: u64,
    tick_count: u64,
}

impl Host<UdpTransport> {
    pub fn bind<S: ToSocketAddrs>(addr: S, config: HostConfig) -> io::Result<Self> {
        Ok(Self::new(UdpTransport::bind(addr)?, config, AcceptAll))
    }
}

impl<T: Transport, A: Authenticator> Host<T, A> {
    pub fn new(transport: T, config: HostConfig, authenticator: A) -> Self {
        let connections = ConnectionManager::with_timeout(config.max_clients, config.timeout);
        Self {
            transport,
            config,
            connections,
            authenticator,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
            rejected_at: HashMap::new(),
            retired_stats: NetworkStats::default(),
            unattributed_malformed: 0,
            tick_count: 0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn connection(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.connections.get(addr)
    }

    /// One protocol tick over every peer.
    pub fn tick(&mut self, now: Instant) {
        for connection in self.connections.iter_mut() {
            connection.check_window();
        }

        let deliveries = self.receive(now);
        for (addr, delivery) in deliveries {
            self.handle_delivery(addr, delivery);
        }

        for mut connection in self.connections.cleanup_timed_out(now) {
            let addr = connection.addr();
            log::info!("{addr} timed out");
            self.retired_stats.accumulate(connection.stats());
            self.pending_events
                .extend(connection_events(addr, &mut connection));
            self.pending_events
                .push_back(HostEvent::PeerTimedOut { addr });
        }

        let timeout = self.config.timeout;
        self.rejected_at
            .retain(|_, at| now.saturating_duration_since(*at) < timeout);

        self.send_all(now);

        for connection in self.connections.iter_mut() {
            let addr = connection.addr();
            self.pending_events
                .extend(connection_events(addr, connection));
        }

        self.tick_count += 1;
    }

    fn receive(&mut self, now: Instant) -> Vec<(SocketAddr, Delivery)> {
        let mut deliveries = Vec::new();

        loop {
            let (len, from) = match self.transport.recv_datagram(&mut self.recv_buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("receive failed: {e}");
                    self.pending_events.push_back(HostEvent::Error {
                        addr: None,
                        message: e.to_string(),
                    });
                    break;
                }
            };

            let packet = match Packet::decode(&self.recv_buffer[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("dropping datagram from {from}: {e}");
                    match self.connections.get_mut(&from) {
                        Some(connection) => connection.record_malformed(),
                        None => self.unattributed_malformed += 1,
                    }
                    continue;
                }
            };

            let connection = match self.connections.get_or_create(from, now) {
                Ok((connection, created)) => {
                    if created {
                        log::info!("{from} connected");
                        self.pending_events
                            .push_back(HostEvent::PeerConnected { addr: from });
                    }
                    connection
                }
                Err(e) => {
                    log::debug!("rejecting {from}: {e}");
                    let timeout = self.config.timeout;
                    let reported = self
                        .rejected_at
                        .get(&from)
                        .is_some_and(|&at| now.saturating_duration_since(at) < timeout);
                    if !reported {
                        self.rejected_at.insert(from, now);
                        self.pending_events.push_back(HostEvent::PeerRejected {
                            addr: from,
                            reason: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            deliveries.extend(
                connection
                    .process(&packet, len, now)
                    .into_iter()
                    .map(|delivery| (from, delivery)),
            );
        }

        deliveries
    }

    fn handle_delivery(&mut self, addr: SocketAddr, delivery: Delivery) {
        let Some(connection) = self.connections.get_mut(&addr) else {
            return;
        };

        match (connection.state(), delivery.kind) {
            (ConnectionState::None, MessageKind::AUTH) => {
                let credentials = match AuthPayload::decode(&delivery.data) {
                    Ok(credentials) => credentials,
                    Err(e) => {
                        log::debug!("{addr}: bad auth payload: {e}");
                        self.pending_events.push_back(HostEvent::Error {
                            addr: Some(addr),
                            message: e.to_string(),
                        });
                        return;
                    }
                };
                log::info!("{addr}: auth request from user {:?}", credentials.user);
                connection.set_state(ConnectionState::TryingAuth);
                if let Err(e) = connection.enqueue(MessageKind::DATA, false, CHECKING_CREDENTIALS)
                {
                    log::warn!("{addr}: could not queue auth reply: {e}");
                }

                let accepted = self.authenticator.authenticate(addr, &credentials);
                if accepted {
                    connection.set_state(ConnectionState::Auth);
                } else {
                    log::info!("{addr}: credentials rejected");
                    connection.set_state(ConnectionState::None);
                }
                if let Err(e) =
                    connection.enqueue(MessageKind::AUTH_RESULT, true, &[u8::from(accepted)])
                {
                    log::warn!("{addr}: could not queue auth result: {e}");
                    self.pending_events.push_back(HostEvent::Error {
                        addr: Some(addr),
                        message: e.to_string(),
                    });
                }
            }
            (_, MessageKind::AUTH) => {
                log::debug!("{addr}: ignoring auth in state {}", connection.state().as_str());
            }
            (ConnectionState::Auth, MessageKind::DATA) => {
                connection.set_state(ConnectionState::InGame);
                self.pending_events
                    .push_back(HostEvent::Message { addr, delivery });
            }
            (ConnectionState::InGame, _) => {
                self.pending_events
                    .push_back(HostEvent::Message { addr, delivery });
            }
            (state, kind) => {
                log::debug!(
                    "{addr}: dropping message kind {} in state {}",
                    kind.raw(),
                    state.as_str()
                );
            }
        }
    }

    fn send_all(&mut self, now: Instant) {
        for connection in self.connections.iter_mut() {
            let addr = connection.addr();
            let bytes = match connection.build_packet(now).encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("{addr}: could not encode packet: {e}");
                    connection.record_send_error();
                    continue;
                }
            };

            match self.transport.send_datagram(addr, &bytes) {
                Ok(sent) => connection.record_sent(sent),
                Err(e) => {
                    log::warn!("{addr}: send failed: {e}");
                    connection.record_send_error();
                    self.pending_events.push_back(HostEvent::Error {
                        addr: Some(addr),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Queues a payload for one peer.
    pub fn send(
        &mut self,
        addr: SocketAddr,
        kind: MessageKind,
        critical: bool,
        payload: &[u8],
    ) -> Result<u8, ProtocolError> {
        let connection = self
            .connections
            .get_mut(&addr)
            .ok_or(ConnectionError::UnknownPeer(addr))?;
        Ok(connection.enqueue(kind, critical, payload)?)
    }

    /// Queues a payload for every peer in game; returns how many accepted it.
    pub fn broadcast(&mut self, kind: MessageKind, critical: bool, payload: &[u8]) -> usize {
        let mut queued = 0;
        for connection in self.connections.iter_mut() {
            if connection.state() != ConnectionState::InGame {
                continue;
            }
            match connection.enqueue(kind, critical, payload) {
                Ok(_) => queued += 1,
                Err(e) => log::warn!("{}: broadcast not queued: {e}", connection.addr()),
            }
        }
        queued
    }

    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        self.pending_events.drain(..).collect()
    }

    /// Totals over live and timed out peers.
    pub fn stats(&self) -> NetworkStats {
        let mut total = self.retired_stats.clone();
        total.packets_malformed += self.unattributed_malformed;
        for connection in self.connections.iter() {
            total.accumulate(connection.stats());
        }
        total.update_loss_percent();
        total
    }
}

fn connection_events(addr: SocketAddr, connection: &mut Connection) -> Vec<HostEvent> {
    connection
        .drain_events()
        .into_iter()
        .map(|event| HostEvent::Protocol { addr, event })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::simulator::NetworkSimulator;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn client_packet(connection: &mut Connection, now: Instant) -> Vec<u8> {
        connection.check_window();
        connection.build_packet(now).encode().unwrap()
    }

    fn auth_bytes(user: &str) -> Vec<u8> {
        AuthPayload::new(user, "1234").unwrap().encode().to_vec()
    }

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.send_rate, 10);
        assert_eq!(config.max_clients, 192);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_first_valid_packet_creates_peer() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), HostConfig::default(), AcceptAll);
        let mut client = sim.bind(addr(2)).unwrap();

        client.send_datagram(addr(1), b"garbage").unwrap();
        host.tick(now);
        assert!(host.connections().is_empty());
        assert_eq!(host.stats().packets_malformed, 1);

        let mut peer = Connection::new(addr(1), now);
        client
            .send_datagram(addr(1), &client_packet(&mut peer, now))
            .unwrap();
        host.tick(now);

        assert_eq!(host.connections().len(), 1);
        assert!(host
            .drain_events()
            .iter()
            .any(|e| matches!(e, HostEvent::PeerConnected { addr: a } if *a == addr(2))));
    }

    #[test]
    fn test_auth_accepted_then_in_game() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), HostConfig::default(), AcceptAll);
        let mut client = sim.bind(addr(2)).unwrap();
        let mut peer = Connection::new(addr(1), now);

        peer.enqueue(MessageKind::AUTH, true, &auth_bytes("anonymous"))
            .unwrap();
        client
            .send_datagram(addr(1), &client_packet(&mut peer, now))
            .unwrap();
        host.tick(now);
        assert_eq!(
            host.connection(&addr(2)).map(Connection::state),
            Some(ConnectionState::Auth)
        );

        // reply carries the text and the critical result
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = client.recv_datagram(&mut buf).unwrap().unwrap();
        let view = Packet::decode(&buf[..len]).unwrap();
        let replies = peer.process(&view, len, now);
        assert_eq!(replies[0].data, CHECKING_CREDENTIALS);
        assert_eq!(replies[1].kind, MessageKind::AUTH_RESULT);
        assert_eq!(replies[1].data, vec![1]);

        peer.enqueue(MessageKind::DATA, false, b"move").unwrap();
        client
            .send_datagram(addr(1), &client_packet(&mut peer, now))
            .unwrap();
        host.tick(now);

        assert_eq!(
            host.connection(&addr(2)).map(Connection::state),
            Some(ConnectionState::InGame)
        );
        assert!(host.drain_events().iter().any(
            |e| matches!(e, HostEvent::Message { delivery, .. } if delivery.data == b"move")
        ));
    }

    #[test]
    fn test_auth_rejected_by_authenticator() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let authenticator =
            |_: SocketAddr, credentials: &AuthPayload| credentials.user != "mallory";
        let mut host = Host::new(
            sim.bind(addr(1)).unwrap(),
            HostConfig::default(),
            authenticator,
        );
        let mut client = sim.bind(addr(2)).unwrap();
        let mut peer = Connection::new(addr(1), now);

        peer.enqueue(MessageKind::AUTH, true, &auth_bytes("mallory"))
            .unwrap();
        client
            .send_datagram(addr(1), &client_packet(&mut peer, now))
            .unwrap();
        host.tick(now);

        assert_eq!(
            host.connection(&addr(2)).map(Connection::state),
            Some(ConnectionState::None)
        );

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = client.recv_datagram(&mut buf).unwrap().unwrap();
        let view = Packet::decode(&buf[..len]).unwrap();
        let replies = peer.process(&view, len, now);
        assert_eq!(replies.last().map(|d| d.data.clone()), Some(vec![0]));
    }

    #[test]
    fn test_data_before_auth_is_dropped() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), HostConfig::default(), AcceptAll);
        let mut client = sim.bind(addr(2)).unwrap();
        let mut peer = Connection::new(addr(1), now);

        peer.enqueue(MessageKind::DATA, false, b"sneaky").unwrap();
        client
            .send_datagram(addr(1), &client_packet(&mut peer, now))
            .unwrap();
        host.tick(now);

        assert!(!host
            .drain_events()
            .iter()
            .any(|e| matches!(e, HostEvent::Message { .. })));
    }

    #[test]
    fn test_peer_times_out() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), HostConfig::default(), AcceptAll);
        let mut client = sim.bind(addr(2)).unwrap();
        let mut peer = Connection::new(addr(1), now);

        client
            .send_datagram(addr(1), &client_packet(&mut peer, now))
            .unwrap();
        host.tick(now);
        host.drain_events();

        host.tick(now + Duration::from_secs(6));
        assert!(host.connections().is_empty());
        assert!(host
            .drain_events()
            .iter()
            .any(|e| matches!(e, HostEvent::PeerTimedOut { .. })));
        assert!(host.stats().packets_sent >= 1);
    }

    #[test]
    fn test_full_host_rejects_new_peer() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let config = HostConfig {
            max_clients: 1,
            ..Default::default()
        };
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), config, AcceptAll);

        for port in [2, 3] {
            let mut client = sim.bind(addr(port)).unwrap();
            let mut peer = Connection::new(addr(1), now);
            client
                .send_datagram(addr(1), &client_packet(&mut peer, now))
                .unwrap();
        }
        host.tick(now);

        assert_eq!(host.connections().len(), 1);
        assert!(host
            .drain_events()
            .iter()
            .any(|e| matches!(e, HostEvent::PeerRejected { addr: a, .. } if *a == addr(3))));
    }

    #[test]
    fn test_rejection_reported_once_per_timeout() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let config = HostConfig {
            max_clients: 1,
            ..Default::default()
        };
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), config, AcceptAll);
        let mut first = sim.bind(addr(2)).unwrap();
        let mut second = sim.bind(addr(3)).unwrap();
        let mut first_peer = Connection::new(addr(1), now);
        let mut second_peer = Connection::new(addr(1), now);

        let rejections = |events: Vec<HostEvent>| {
            events
                .iter()
                .filter(|e| matches!(e, HostEvent::PeerRejected { .. }))
                .count()
        };

        first
            .send_datagram(addr(1), &client_packet(&mut first_peer, now))
            .unwrap();
        for _ in 0..3 {
            second
                .send_datagram(addr(1), &client_packet(&mut second_peer, now))
                .unwrap();
        }
        host.tick(now);
        assert_eq!(rejections(host.drain_events()), 1);

        let soon = now + Duration::from_secs(1);
        sim.advance(soon);
        second
            .send_datagram(addr(1), &client_packet(&mut second_peer, soon))
            .unwrap();
        host.tick(soon);
        assert_eq!(rejections(host.drain_events()), 0);

        let later = now + Duration::from_secs(6);
        sim.advance(later);
        second
            .send_datagram(addr(1), &client_packet(&mut second_peer, later))
            .unwrap();
        host.tick(later);
        assert_eq!(rejections(host.drain_events()), 1);
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let sim = NetworkSimulator::new(Instant::now());
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), HostConfig::default(), AcceptAll);

        assert!(matches!(
            host.send(addr(9), MessageKind::DATA, false, b"x"),
            Err(ProtocolError::Connection(ConnectionError::UnknownPeer(_)))
        ));
    }
}
