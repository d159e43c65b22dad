use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tickwire::net::{AcceptAll, LossyTransport, ProtocolEvent};
use tickwire::{
    ConnectionState, Host, HostEvent, NetworkStats, TickPacer, Transport, UdpTransport,
};

use crate::config::ServerConfig;

pub struct TickwireServer {
    host: Host<Box<dyn Transport>>,
    config: ServerConfig,
    start_time: Instant,
}

impl TickwireServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let socket = UdpTransport::bind(bind_addr)?;
        let transport: Box<dyn Transport> = match &config.packet_loss {
            Some(simulation) => Box::new(LossyTransport::new(socket, simulation.clone())),
            None => Box::new(socket),
        };
        Ok(Self::with_transport(transport, config))
    }

    pub fn with_transport(transport: Box<dyn Transport>, config: ServerConfig) -> Self {
        Self {
            host: Host::new(transport, config.host_config(), AcceptAll),
            config,
            start_time: Instant::now(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.host.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.host.running()
    }

    pub fn tick_once(&mut self, now: Instant) {
        self.host.tick(now);
    }

    pub fn drain_events(&mut self) -> Vec<HostEvent> {
        self.host.drain_events()
    }

    /// Headless loop: ticks at the send rate and logs every event.
    pub fn run(&mut self) {
        let running = self.running();
        let mut pacer = TickPacer::new(self.config.send_rate, Instant::now());

        while running.load(Ordering::SeqCst) {
            let now = pacer.wait();
            self.tick_once(now);

            for event in self.drain_events() {
                let (level, text) = describe_event(&event);
                log::log!(level, "{}", text);
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.host.tick_count(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            client_count: self.host.connections().len(),
            in_game_count: self
                .host
                .connections()
                .count_in_state(ConnectionState::InGame),
            max_clients: self.host.connections().max_connections(),
            network_stats: self.host.stats(),
        }
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self
            .host
            .connections()
            .iter()
            .map(|c| ClientInfo {
                addr: c.addr().to_string(),
                state: c.state(),
                local_sequence: c.acks().sequence(),
                remote_sequence: c.receive_tracker().last_sequence(),
                queue_len: c.queue().len(),
                in_flight: c.queue().in_flight_count(),
                loss_percent: c.stats().packet_loss_percent,
                rtt_ms: c.acks().srtt(),
                connected_secs: c.created_at().elapsed().as_secs(),
            })
            .collect();
        infos.sort_by(|a, b| a.addr.cmp(&b.addr));
        infos
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u64,
    pub uptime_secs: u64,
    pub client_count: usize,
    pub in_game_count: usize,
    pub max_clients: usize,
    pub network_stats: NetworkStats,
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub addr: String,
    pub state: ConnectionState,
    pub local_sequence: u32,
    pub remote_sequence: u32,
    pub queue_len: usize,
    pub in_flight: usize,
    pub loss_percent: f32,
    pub rtt_ms: f32,
    pub connected_secs: u64,
}

pub fn describe_event(event: &HostEvent) -> (log::Level, String) {
    match event {
        HostEvent::PeerConnected { addr } => (log::Level::Info, format!("{} connected", addr)),
        HostEvent::PeerTimedOut { addr } => (log::Level::Info, format!("{} timed out", addr)),
        HostEvent::PeerRejected { addr, reason } => (
            log::Level::Warn,
            format!("{} rejected: {}", addr, reason),
        ),
        HostEvent::Message { addr, delivery } => (
            log::Level::Info,
            format!(
                "{} sent kind {} ({} bytes): {}",
                addr,
                delivery.kind.raw(),
                delivery.data.len(),
                String::from_utf8_lossy(&delivery.data)
            ),
        ),
        HostEvent::Protocol { addr, event } => describe_protocol_event(*addr, event),
        HostEvent::Error { addr: Some(addr), message } => {
            (log::Level::Error, format!("{}: {}", addr, message))
        }
        HostEvent::Error { addr: None, message } => (log::Level::Error, message.clone()),
    }
}

fn describe_protocol_event(addr: SocketAddr, event: &ProtocolEvent) -> (log::Level, String) {
    match event {
        ProtocolEvent::PacketLost { sequence, critical } => (
            if *critical { log::Level::Warn } else { log::Level::Debug },
            format!("{} lost packet {} (critical: {})", addr, sequence, critical),
        ),
        ProtocolEvent::MessageDelivered(info) => (
            log::Level::Debug,
            format!("{} acked message {}/{}", addr, info.fragment_id, info.order),
        ),
        ProtocolEvent::MessageDropped(info) => (
            log::Level::Debug,
            format!("{} dropped message {}/{}", addr, info.fragment_id, info.order),
        ),
        ProtocolEvent::MessageRequeued(info) => (
            log::Level::Debug,
            format!("{} requeued message {}/{}", addr, info.fragment_id, info.order),
        ),
        ProtocolEvent::WindowResync(reason) => (
            log::Level::Warn,
            format!("{} window resync: {}", addr, reason.as_str()),
        ),
        ProtocolEvent::StateChanged { from, to } => (
            log::Level::Info,
            format!("{} {} -> {}", addr, from.as_str(), to.as_str()),
        ),
    }
}
