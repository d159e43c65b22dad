pub mod net;
pub mod tick;

pub use net::{
    AuthPayload, Connection, ConnectionManager, ConnectionState, Delivery, Host, HostConfig,
    HostEvent, Message, MessageKind, NetworkStats, Packet, PacketError, PacketLossSimulation,
    ProtocolError, ProtocolEvent, Session, SessionConfig, SessionEvent, Transport, UdpTransport,
    DEFAULT_PORT, MAX_PACKET_SIZE,
};
pub use tick::TickPacer;
