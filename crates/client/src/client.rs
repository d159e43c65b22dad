use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

use anyhow::{Context, Result};
use tickwire::net::{LossyTransport, QueueError, QUEUE_CAPACITY};
use tickwire::{
    ConnectionState, MessageKind, ProtocolEvent, Session, SessionEvent, TickPacer, Transport,
    UdpTransport,
};

use crate::config::ClientConfig;

pub struct TickwireClient {
    session: Session<Box<dyn Transport>>,
    outbox: VecDeque<String>,
    critical: bool,
    max_ticks: Option<u64>,
}

impl TickwireClient {
    pub fn connect(config: ClientConfig, now: Instant) -> Result<Self> {
        let server = config
            .server
            .to_socket_addrs()
            .with_context(|| format!("resolving {}", config.server))?
            .next()
            .with_context(|| format!("no address for {}", config.server))?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpTransport::bind(bind_addr)?;
        let transport: Box<dyn Transport> = match &config.packet_loss {
            Some(simulation) => Box::new(LossyTransport::new(socket, simulation.clone())),
            None => Box::new(socket),
        };
        Self::with_transport(transport, server, config, now)
    }

    pub fn with_transport(
        transport: Box<dyn Transport>,
        server: SocketAddr,
        config: ClientConfig,
        now: Instant,
    ) -> Result<Self> {
        let session = Session::new(transport, server, config.session, now)?;
        Ok(Self {
            session,
            outbox: config.messages.into(),
            critical: config.critical,
            max_ticks: config.max_ticks,
        })
    }

    pub fn session(&self) -> &Session<Box<dyn Transport>> {
        &self.session
    }

    pub fn pending_messages(&self) -> usize {
        self.outbox.len()
    }

    pub fn is_finished(&self) -> bool {
        self.session.is_rejected()
            || self
                .max_ticks
                .is_some_and(|max| self.session.tick_count() >= max)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        if self.session.state() == ConnectionState::InGame {
            self.flush_outbox();
        }
        self.session.tick(now);
        self.session.drain_events()
    }

    /// Paces ticks at the session send rate and logs events until finished.
    pub fn run(&mut self) {
        let mut pacer = TickPacer::new(self.session.config().send_rate, Instant::now());

        while self.session.is_running() && !self.is_finished() {
            let now = pacer.wait();
            for event in self.tick(now) {
                let (level, text) = describe_event(&event);
                log::log!(level, "{}", text);
            }
        }

        let stats = self.session.connection().stats();
        log::info!(
            "{} packets sent, {} received, {} lost, rtt {:.1}ms",
            stats.packets_sent,
            stats.packets_received,
            stats.packets_lost,
            self.session.connection().acks().srtt()
        );
    }

    /// Queues outbox entries in order. A payload that can never fit the send
    /// queue is dropped; anything else waits for acks to free slots.
    fn flush_outbox(&mut self) {
        while let Some(text) = self.outbox.front() {
            match self
                .session
                .send(MessageKind::DATA, self.critical, text.as_bytes())
            {
                Ok(id) => {
                    log::debug!("queued {:?} as fragment id {}", text, id);
                    self.outbox.pop_front();
                }
                Err(QueueError::Full { needed, .. }) if needed > QUEUE_CAPACITY - 1 => {
                    log::warn!(
                        "dropping {} byte message: needs {} queue slots, at most {} fit",
                        text.len(),
                        needed,
                        QUEUE_CAPACITY - 1
                    );
                    self.outbox.pop_front();
                }
                Err(e) => {
                    log::debug!("send queue busy: {}", e);
                    break;
                }
            }
        }
    }
}

pub fn describe_event(event: &SessionEvent) -> (log::Level, String) {
    match event {
        SessionEvent::Message(delivery) => (
            log::Level::Info,
            format!("server: {}", String::from_utf8_lossy(&delivery.data)),
        ),
        SessionEvent::AuthResult { accepted: true } => {
            (log::Level::Info, "credentials accepted".to_string())
        }
        SessionEvent::AuthResult { accepted: false } => {
            (log::Level::Error, "credentials rejected".to_string())
        }
        SessionEvent::TimedOut => (log::Level::Warn, "server timed out, reconnecting".to_string()),
        SessionEvent::Error { message } => (log::Level::Error, message.clone()),
        SessionEvent::Protocol(ProtocolEvent::StateChanged { from, to }) => (
            log::Level::Info,
            format!("{} -> {}", from.as_str(), to.as_str()),
        ),
        SessionEvent::Protocol(ProtocolEvent::PacketLost { sequence, critical: true }) => (
            log::Level::Warn,
            format!("packet {} with critical data lost", sequence),
        ),
        SessionEvent::Protocol(event) => (log::Level::Debug, format!("{:?}", event)),
    }
}
