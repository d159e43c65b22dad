use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::{Connection, ConnectionState, DEFAULT_TIMEOUT};
use super::error::ProtocolError;
use super::events::SessionEvent;
use super::message::{decode_auth_result, AuthPayload, MessageKind, PayloadError};
use super::protocol::{Packet, MAX_PACKET_SIZE};
use super::queue::QueueError;
use super::reassembly::Delivery;
use super::transport::{Transport, UdpTransport};

pub const DEFAULT_SESSION_SEND_RATE: u32 = 32;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub send_rate: u32,
    pub timeout: Duration,
    pub user: String,
    pub password: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_rate: DEFAULT_SESSION_SEND_RATE,
            timeout: DEFAULT_TIMEOUT,
            user: "anonymous".to_string(),
            password: "1234".to_string(),
        }
    }
}

/// Client role: a single [`Connection`] to the server.
pub struct Session<T> {
    transport: T,
    server: SocketAddr,
    config: SessionConfig,
    credentials: AuthPayload,
    connection: Connection,
    recv_buffer: [u8; MAX_PACKET_SIZE],
    running: Arc<AtomicBool>,
    pending_events: VecDeque<SessionEvent>,
    rejected: bool,
    tick_count: u64,
}

impl Session<UdpTransport> {
    pub fn connect<S: ToSocketAddrs>(
        server: S,
        config: SessionConfig,
        now: Instant,
    ) -> Result<Self, ProtocolError> {
        let server = server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no server address"))?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let transport = UdpTransport::bind(bind_addr)?;
        Ok(Self::new(transport, server, config, now)?)
    }
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        server: SocketAddr,
        config: SessionConfig,
        now: Instant,
    ) -> Result<Self, PayloadError> {
        let credentials = AuthPayload::new(config.user.clone(), config.password.clone())?;
        Ok(Self {
            transport,
            server,
            config,
            credentials,
            connection: Connection::new(server, now),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
            rejected: false,
            tick_count: 0,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected
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

    pub fn send(
        &mut self,
        kind: MessageKind,
        critical: bool,
        payload: &[u8],
    ) -> Result<u8, QueueError> {
        self.connection.enqueue(kind, critical, payload)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.pending_events.drain(..).collect()
    }

    pub fn tick(&mut self, now: Instant) {
        self.connection.check_window();

        for delivery in self.receive(now) {
            self.handle_delivery(delivery);
        }

        if self.connection.is_timed_out(now, self.config.timeout) {
            log::warn!("{}: no reply for {:?}, starting over", self.server, self.config.timeout);
            self.collect_protocol_events();
            self.pending_events.push_back(SessionEvent::TimedOut);
            self.connection = Connection::new(self.server, now);
        }

        self.advance_state();
        self.send_packet(now);
        self.collect_protocol_events();
        self.tick_count += 1;
    }

    fn receive(&mut self, now: Instant) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        loop {
            let (len, from) = match self.transport.recv_datagram(&mut self.recv_buffer) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("receive failed: {e}");
                    self.pending_events.push_back(SessionEvent::Error {
                        message: e.to_string(),
                    });
                    break;
                }
            };

            if from != self.server {
                log::debug!("ignoring datagram from {from}");
                continue;
            }

            match Packet::decode(&self.recv_buffer[..len]) {
                Ok(packet) => deliveries.extend(self.connection.process(&packet, len, now)),
                Err(e) => {
                    log::debug!("dropping datagram from {from}: {e}");
                    self.connection.record_malformed();
                }
            }
        }

        deliveries
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        if delivery.kind != MessageKind::AUTH_RESULT {
            self.pending_events.push_back(SessionEvent::Message(delivery));
            return;
        }

        let accepted = match decode_auth_result(&delivery.data) {
            Ok(accepted) => accepted,
            Err(e) => {
                log::debug!("bad auth result: {e}");
                return;
            }
        };
        if self.connection.state() != ConnectionState::TryingAuth {
            log::debug!("auth result in state {}", self.connection.state().as_str());
            return;
        }

        self.pending_events
            .push_back(SessionEvent::AuthResult { accepted });
        if accepted {
            log::info!("authenticated as {:?}", self.credentials.user);
            self.connection.set_state(ConnectionState::Auth);
        } else {
            log::warn!("credentials for {:?} rejected", self.credentials.user);
            self.rejected = true;
            self.connection.set_state(ConnectionState::None);
        }
    }

    fn advance_state(&mut self) {
        match self.connection.state() {
            ConnectionState::None if !self.rejected => {
                let auth = self.credentials.encode();
                match self.connection.enqueue(MessageKind::AUTH, true, &auth) {
                    Ok(_) => self.connection.set_state(ConnectionState::TryingAuth),
                    Err(e) => log::warn!("could not queue auth request: {e}"),
                }
            }
            ConnectionState::Auth => self.connection.set_state(ConnectionState::InGame),
            _ => {}
        }
    }

    fn send_packet(&mut self, now: Instant) {
        let bytes = match self.connection.build_packet(now).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("could not encode packet: {e}");
                self.connection.record_send_error();
                return;
            }
        };

        match self.transport.send_datagram(self.server, &bytes) {
            Ok(sent) => self.connection.record_sent(sent),
            Err(e) => {
                log::warn!("send to {} failed: {e}", self.server);
                self.connection.record_send_error();
                self.pending_events.push_back(SessionEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    fn collect_protocol_events(&mut self) {
        self.pending_events.extend(
            self.connection
                .drain_events()
                .into_iter()
                .map(SessionEvent::Protocol),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::host::{AcceptAll, Authenticator, Host, HostConfig, CHECKING_CREDENTIALS};
    use crate::net::simulator::NetworkSimulator;
    use crate::net::HostEvent;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn step(
        sim: &NetworkSimulator,
        host: &mut Host<impl Transport, impl Authenticator>,
        session: &mut Session<impl Transport>,
        now: Instant,
    ) {
        sim.advance(now);
        session.tick(now);
        host.tick(now);
    }


    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.send_rate, 32);
        assert_eq!(config.user, "anonymous");
        assert_eq!(config.password, "1234");
    }

    #[test]
    fn test_rejects_overlong_credentials() {
        let sim = NetworkSimulator::new(Instant::now());
        let config = SessionConfig {
            user: "x".repeat(17),
            ..Default::default()
        };
        assert!(Session::new(sim.bind(addr(2)).unwrap(), addr(1), config, Instant::now()).is_err());
    }

    #[test]
    fn test_handshake_reaches_in_game() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let mut host = Host::new(sim.bind(addr(1)).unwrap(), HostConfig::default(), AcceptAll);
        let mut session = Session::new(
            sim.bind(addr(2)).unwrap(),
            addr(1),
            SessionConfig::default(),
            now,
        )
        .unwrap();

        session.tick(now);
        assert_eq!(session.state(), ConnectionState::TryingAuth);

        for i in 1..4 {
            step(&sim, &mut host, &mut session, now + Duration::from_millis(i * 30));
        }

        assert_eq!(session.state(), ConnectionState::InGame);
        let events = session.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::AuthResult { accepted: true })));
        assert!(events.iter().any(
            |e| matches!(e, SessionEvent::Message(d) if d.data == CHECKING_CREDENTIALS)
        ));

        session.send(MessageKind::DATA, true, b"hello").unwrap();
        step(&sim, &mut host, &mut session, now + Duration::from_millis(200));

        assert!(host.drain_events().iter().any(
            |e| matches!(e, HostEvent::Message { delivery, .. } if delivery.data == b"hello")
        ));
        assert_eq!(
            host.connection(&addr(2)).map(Connection::state),
            Some(ConnectionState::InGame)
        );
    }

    #[test]
    fn test_rejected_session_stops_retrying() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let mut host = Host::new(
            sim.bind(addr(1)).unwrap(),
            HostConfig::default(),
            |_: SocketAddr, _: &AuthPayload| false,
        );
        let mut session = Session::new(
            sim.bind(addr(2)).unwrap(),
            addr(1),
            SessionConfig::default(),
            now,
        )
        .unwrap();

        for i in 0..10 {
            step(&sim, &mut host, &mut session, now + Duration::from_millis(i * 30));
        }

        assert!(session.is_rejected());
        assert_eq!(session.state(), ConnectionState::None);
        assert_eq!(session.connection().queue().len(), 0);
        assert!(session
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::AuthResult { accepted: false })));
    }

    #[test]
    fn test_silent_server_times_out() {
        let now = Instant::now();
        let sim = NetworkSimulator::new(now);
        let _server = sim.bind(addr(1)).unwrap();
        let mut session = Session::new(
            sim.bind(addr(2)).unwrap(),
            addr(1),
            SessionConfig::default(),
            now,
        )
        .unwrap();

        session.tick(now);
        session.tick(now + Duration::from_secs(6));

        assert!(session
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::TimedOut)));
        // a fresh connection immediately asks again
        assert_eq!(session.state(), ConnectionState::TryingAuth);
        assert_eq!(session.connection().acks().sequence(), 0);
    }
}
