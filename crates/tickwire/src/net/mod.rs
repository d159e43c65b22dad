pub mod connection;
pub mod error;
pub mod events;
pub mod host;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod reassembly;
pub mod retransmit;
pub mod sequence;
pub mod session;
pub mod simulator;
pub mod stats;
pub mod tracking;
pub mod transport;
pub mod window;

pub use connection::{Connection, ConnectionManager, ConnectionState, DEFAULT_TIMEOUT};
pub use error::{ConnectionError, ProtocolError};
pub use events::{HostEvent, MessageInfo, ProtocolEvent, ResyncReason, SessionEvent};
pub use host::{AcceptAll, Authenticator, Host, HostConfig, CHECKING_CREDENTIALS};
pub use message::{AuthPayload, Message, MessageFlags, MessageKind, MessageView, PayloadError};
pub use protocol::{
    Packet, PacketError, PacketHeader, PacketView, DEFAULT_PORT, MAX_PACKET_SIZE,
    PACKET_HEADER_SIZE, PAYLOAD_CAPACITY, PROTOCOL_ID,
};
pub use queue::{MessageQueue, QueueError, Slot, QUEUE_CAPACITY};
pub use reassembly::{Delivery, Reassembler};
pub use retransmit::{LostPacket, PacketSlotState, RetransmitPolicy};
pub use sequence::{sequence_greater_than, sequence_greater_than_u16, sequence_greater_than_u8};
pub use session::{Session, SessionConfig};
pub use simulator::{LossyTransport, NetworkSimulator, SimulatedTransport};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use tracking::{AckTracker, ReceiveTracker};
pub use transport::{Transport, UdpTransport};
