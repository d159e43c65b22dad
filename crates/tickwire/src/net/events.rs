use std::net::SocketAddr;

use super::connection::ConnectionState;
use super::message::{Message, MessageKind};
use super::reassembly::Delivery;

/// Identifies a queued message in events without carrying its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub kind: MessageKind,
    pub critical: bool,
    pub fragment_id: u8,
    pub order: u8,
    pub len: usize,
}

impl From<&Message> for MessageInfo {
    fn from(message: &Message) -> Self {
        Self {
            kind: message.kind,
            critical: message.critical,
            fragment_id: message.fragment_id,
            order: message.order,
            len: message.data.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// Peer sequence jumped a full window or more.
    ReceiveGap { gap: u32 },
    /// Peer ack lags our sequence by a full window or more.
    AckDesync { gap: u32 },
    /// Peer acknowledged a sequence we never sent.
    AckAhead { ack: u32, sequence: u32 },
}

impl ResyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncReason::ReceiveGap { .. } => "receive gap",
            ResyncReason::AckDesync { .. } => "ack desync",
            ResyncReason::AckAhead { .. } => "ack ahead",
        }
    }
}

/// Per-connection protocol activity, drained once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    PacketLost {
        sequence: u32,
        critical: bool,
    },
    MessageDelivered(MessageInfo),
    MessageDropped(MessageInfo),
    MessageRequeued(MessageInfo),
    WindowResync(ResyncReason),
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Debug, Clone)]
pub enum HostEvent {
    PeerConnected {
        addr: SocketAddr,
    },
    PeerTimedOut {
        addr: SocketAddr,
    },
    PeerRejected {
        addr: SocketAddr,
        reason: String,
    },
    Message {
        addr: SocketAddr,
        delivery: Delivery,
    },
    Protocol {
        addr: SocketAddr,
        event: ProtocolEvent,
    },
    Error {
        addr: Option<SocketAddr>,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message(Delivery),
    Protocol(ProtocolEvent),
    AuthResult { accepted: bool },
    TimedOut,
    Error { message: String },
}
