use super::message::{Message, MessageKind, MessageView, MAX_MESSAGE_DATA, MESSAGE_HEADER_SIZE};

/// 576-byte minimum reassembly MTU minus a 60-byte IP header and 8-byte UDP header.
pub const MAX_PACKET_SIZE: usize = 508;
pub const PACKET_HEADER_SIZE: usize = 16;
pub const PAYLOAD_CAPACITY: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;
pub const MAX_MESSAGES_PER_PACKET: usize = PAYLOAD_CAPACITY / MESSAGE_HEADER_SIZE;
pub const PROTOCOL_ID: u16 = 0b1000;
pub const DEFAULT_PORT: u16 = 30000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol_id: u16,
    pub message_count: u16,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            protocol_id: PROTOCOL_ID,
            message_count: 0,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.protocol_id == PROTOCOL_ID
    }

    fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.protocol_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.message_count.to_le_bytes());
        out[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        out[8..12].copy_from_slice(&self.ack.to_le_bytes());
        out[12..16].copy_from_slice(&self.ack_bitfield.to_le_bytes());
    }

    fn read(bytes: &[u8]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Self {
            protocol_id: u16_at(0),
            message_count: u16_at(2),
            sequence: u32_at(4),
            ack: u32_at(8),
            ack_bitfield: u32_at(12),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("datagram of {len} bytes is shorter than the {PACKET_HEADER_SIZE}-byte header")]
    TooShort { len: usize },
    #[error("datagram of {len} bytes exceeds {MAX_PACKET_SIZE} bytes")]
    TooLong { len: usize },
    #[error("unknown protocol id {found:#06x}")]
    InvalidProtocol { found: u16 },
    #[error("declared {count} messages, at most {MAX_MESSAGES_PER_PACKET} fit a packet")]
    TooManyMessages { count: usize },
    #[error("message {index} declares {len} bytes, limit is {MAX_MESSAGE_DATA}")]
    MessageTooLarge { index: usize, len: usize },
    #[error("message {index} needs {needed} bytes but only {available} remain")]
    Truncated {
        index: usize,
        needed: usize,
        available: usize,
    },
    #[error("messages need {size} payload bytes, capacity is {PAYLOAD_CAPACITY}")]
    PayloadOverflow { size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub messages: Vec<Message>,
}

impl Packet {
    pub fn new(header: PacketHeader, messages: Vec<Message>) -> Self {
        Self { header, messages }
    }

    pub fn payload_size(&self) -> usize {
        self.messages.iter().map(Message::wire_size).sum()
    }

    pub fn has_critical(&self) -> bool {
        self.messages.iter().any(|m| m.critical)
    }

    /// Serializes into a fixed [`MAX_PACKET_SIZE`] datagram, zero padded
    /// after the last message.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.messages.len() > MAX_MESSAGES_PER_PACKET {
            return Err(PacketError::TooManyMessages {
                count: self.messages.len(),
            });
        }
        if let Some((index, message)) = self
            .messages
            .iter()
            .enumerate()
            .find(|(_, m)| m.data.len() > MAX_MESSAGE_DATA)
        {
            return Err(PacketError::MessageTooLarge {
                index,
                len: message.data.len(),
            });
        }
        let size = self.payload_size();
        if size > PAYLOAD_CAPACITY {
            return Err(PacketError::PayloadOverflow { size });
        }

        let mut bytes = vec![0u8; MAX_PACKET_SIZE];
        let header = PacketHeader {
            message_count: self.messages.len() as u16,
            ..self.header
        };
        header.write(&mut bytes[..PACKET_HEADER_SIZE]);

        let mut offset = PACKET_HEADER_SIZE;
        for message in &self.messages {
            bytes[offset] = message.data.len() as u8;
            bytes[offset + 1] = message.kind.to_wire(message.critical);
            bytes[offset + 2] = message.fragment_id;
            bytes[offset + 3] = message.order;
            offset += MESSAGE_HEADER_SIZE;
            bytes[offset..offset + message.data.len()].copy_from_slice(&message.data);
            offset += message.data.len();
        }

        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<PacketView<'_>, PacketError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort { len: bytes.len() });
        }
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLong { len: bytes.len() });
        }

        let header = PacketHeader::read(bytes);
        if !header.is_valid() {
            return Err(PacketError::InvalidProtocol {
                found: header.protocol_id,
            });
        }

        let count = usize::from(header.message_count);
        if count > MAX_MESSAGES_PER_PACKET {
            return Err(PacketError::TooManyMessages { count });
        }

        let payload = &bytes[PACKET_HEADER_SIZE..];
        let mut messages = Vec::with_capacity(count);
        let mut offset = 0;

        for index in 0..count {
            let available = payload.len() - offset;
            if available < MESSAGE_HEADER_SIZE {
                return Err(PacketError::Truncated {
                    index,
                    needed: MESSAGE_HEADER_SIZE,
                    available,
                });
            }

            let len = usize::from(payload[offset]);
            if len > MAX_MESSAGE_DATA {
                return Err(PacketError::MessageTooLarge { index, len });
            }
            let needed = MESSAGE_HEADER_SIZE + len;
            if available < needed {
                return Err(PacketError::Truncated {
                    index,
                    needed,
                    available,
                });
            }

            let (kind, critical) = MessageKind::from_wire(payload[offset + 1]);
            let data_start = offset + MESSAGE_HEADER_SIZE;
            messages.push(MessageView {
                kind,
                critical,
                fragment_id: payload[offset + 2],
                order: payload[offset + 3],
                data: &payload[data_start..data_start + len],
            });
            offset += needed;
        }

        Ok(PacketView { header, messages })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketView<'a> {
    pub header: PacketHeader,
    pub messages: Vec<MessageView<'a>>,
}

impl PacketView<'_> {
    pub fn to_packet(&self) -> Packet {
        Packet {
            header: self.header,
            messages: self.messages.iter().map(MessageView::to_message).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_packet() -> Packet {
        let mut header = PacketHeader::new(42, 17, 0xDEAD_BEEF);
        header.message_count = 2;
        Packet::new(
            header,
            vec![
                Message::new(MessageKind::AUTH, true, 3, 0, &[1u8; 32]),
                Message::new(MessageKind::DATA, false, 4, 0, b"Checking credentials\0"),
            ],
        )
    }

    #[test]
    fn test_header_layout_little_endian() {
        let bytes = sample_packet().encode().unwrap();

        assert_eq!(bytes.len(), MAX_PACKET_SIZE);
        assert_eq!(&bytes[0..2], &PROTOCOL_ID.to_le_bytes());
        assert_eq!(&bytes[2..4], &2u16.to_le_bytes());
        assert_eq!(&bytes[4..8], &42u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &17u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0xDEAD_BEEFu32.to_le_bytes());
        // first message header: len, type|critical, id, order
        assert_eq!(&bytes[16..20], &[32, 0x81, 3, 0]);
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = sample_packet();
        let bytes = packet.encode().unwrap();
        let view = Packet::decode(&bytes).unwrap();

        assert_eq!(view.to_packet(), packet);
    }

    #[test]
    fn test_decode_strips_critical_bit_from_kind() {
        let bytes = sample_packet().encode().unwrap();
        let view = Packet::decode(&bytes).unwrap();

        assert_eq!(view.messages[0].kind, MessageKind::AUTH);
        assert!(view.messages[0].critical);
    }

    #[test]
    fn test_decode_accepts_unpadded_datagram() {
        let packet = sample_packet();
        let bytes = packet.encode().unwrap();
        let used = PACKET_HEADER_SIZE + packet.payload_size();

        let view = Packet::decode(&bytes[..used]).unwrap();
        assert_eq!(view.messages.len(), 2);
    }

    #[test]
    fn test_decode_rejects_wrong_protocol() {
        let mut bytes = sample_packet().encode().unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::InvalidProtocol { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_short_and_long() {
        assert_eq!(
            Packet::decode(&[0u8; 8]),
            Err(PacketError::TooShort { len: 8 })
        );
        assert_eq!(
            Packet::decode(&[0u8; MAX_PACKET_SIZE + 1]),
            Err(PacketError::TooLong {
                len: MAX_PACKET_SIZE + 1
            })
        );
    }

    #[test]
    fn test_decode_rejects_count_overrun() {
        let packet = sample_packet();
        let mut bytes = packet.encode().unwrap();
        let used = PACKET_HEADER_SIZE + packet.payload_size();
        bytes[2..4].copy_from_slice(&3u16.to_le_bytes());

        assert!(matches!(
            Packet::decode(&bytes[..used]),
            Err(PacketError::Truncated { index: 2, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_length_overrun() {
        let packet = sample_packet();
        let bytes = packet.encode().unwrap();
        let used = PACKET_HEADER_SIZE + packet.payload_size();

        assert!(matches!(
            Packet::decode(&bytes[..used - 1]),
            Err(PacketError::Truncated { index: 1, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_message() {
        let mut bytes = sample_packet().encode().unwrap();
        bytes[PACKET_HEADER_SIZE] = (MAX_MESSAGE_DATA + 1) as u8;

        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::MessageTooLarge { index: 0, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_payload_overflow() {
        let messages = (0..5)
            .map(|i| Message::new(MessageKind::DATA, false, i, 0, &[0u8; MAX_MESSAGE_DATA]))
            .collect();
        let packet = Packet::new(PacketHeader::new(0, 0, 0), messages);

        assert_eq!(
            packet.encode(),
            Err(PacketError::PayloadOverflow { size: 500 })
        );
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            0u8..=MessageKind::MAX,
            any::<bool>(),
            any::<u8>(),
            any::<u8>(),
            proptest::collection::vec(any::<u8>(), 0..=MAX_MESSAGE_DATA),
        )
            .prop_map(|(kind, critical, id, order, data)| {
                let kind = MessageKind::new(kind).unwrap_or(MessageKind::DATA);
                Message::new(kind, critical, id, order, &data)
            })
    }

    proptest! {
        #[test]
        fn round_trip_for_messages_that_fit(
            seq in any::<u32>(),
            ack in any::<u32>(),
            bits in any::<u32>(),
            messages in proptest::collection::vec(arb_message(), 0..8),
        ) {
            let mut fitting = Vec::new();
            let mut used = 0;
            for message in messages {
                if used + message.wire_size() > PAYLOAD_CAPACITY {
                    break;
                }
                used += message.wire_size();
                fitting.push(message);
            }

            let mut header = PacketHeader::new(seq, ack, bits);
            header.message_count = fitting.len() as u16;
            let packet = Packet::new(header, fitting);

            let bytes = packet.encode().unwrap();
            let decoded = Packet::decode(&bytes).unwrap().to_packet();
            prop_assert_eq!(decoded, packet);
        }
    }
}
