use std::io;
use std::net::SocketAddr;

use super::message::PayloadError;
use super::protocol::PacketError;
use super::queue::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection table full ({max} peers)")]
    Full { max: usize },
    #[error("unknown peer {0}")]
    UnknownPeer(SocketAddr),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("payload: {0}")]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
