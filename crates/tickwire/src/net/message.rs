use bitflags::bitflags;

pub const MESSAGE_HEADER_SIZE: usize = 4;
pub const MAX_MESSAGE_DATA: usize = 96;
pub const AUTH_FIELD_SIZE: usize = 16;
pub const AUTH_PAYLOAD_SIZE: usize = AUTH_FIELD_SIZE * 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u8 {
        const CRITICAL = 1 << 7;
    }
}

/// 7-bit application message type. The high bit of the wire byte belongs to
/// [`MessageFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(u8);

impl MessageKind {
    pub const DATA: Self = Self(0);
    pub const AUTH: Self = Self(1);
    pub const BUFFER: Self = Self(2);
    pub const AUTH_RESULT: Self = Self(3);

    pub const MAX: u8 = 0x7F;

    pub const fn new(raw: u8) -> Option<Self> {
        if raw <= Self::MAX {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub fn to_wire(self, critical: bool) -> u8 {
        let mut flags = MessageFlags::empty();
        flags.set(MessageFlags::CRITICAL, critical);
        self.0 | flags.bits()
    }

    pub fn from_wire(byte: u8) -> (Self, bool) {
        let flags = MessageFlags::from_bits_truncate(byte);
        (
            Self(byte & Self::MAX),
            flags.contains(MessageFlags::CRITICAL),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub critical: bool,
    pub fragment_id: u8,
    pub order: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, critical: bool, fragment_id: u8, order: u8, data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_MESSAGE_DATA);
        Self {
            kind,
            critical,
            fragment_id,
            order,
            data: data.to_vec(),
        }
    }

    pub fn wire_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.data.len()
    }

    pub fn view(&self) -> MessageView<'_> {
        MessageView {
            kind: self.kind,
            critical: self.critical,
            fragment_id: self.fragment_id,
            order: self.order,
            data: &self.data,
        }
    }
}

/// Borrowed message decoded straight out of a datagram buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageView<'a> {
    pub kind: MessageKind,
    pub critical: bool,
    pub fragment_id: u8,
    pub order: u8,
    pub data: &'a [u8],
}

impl MessageView<'_> {
    pub fn to_message(&self) -> Message {
        Message::new(self.kind, self.critical, self.fragment_id, self.order, self.data)
    }

    pub fn wire_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("expected {expected} payload bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("field longer than {max} bytes")]
    FieldTooLong { max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    pub user: String,
    pub password: String,
}

impl AuthPayload {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Result<Self, PayloadError> {
        let payload = Self {
            user: user.into(),
            password: password.into(),
        };
        if payload.user.len() > AUTH_FIELD_SIZE || payload.password.len() > AUTH_FIELD_SIZE {
            return Err(PayloadError::FieldTooLong {
                max: AUTH_FIELD_SIZE,
            });
        }
        Ok(payload)
    }

    pub fn encode(&self) -> [u8; AUTH_PAYLOAD_SIZE] {
        let mut bytes = [0u8; AUTH_PAYLOAD_SIZE];
        let user = self.user.as_bytes();
        let password = self.password.as_bytes();
        let user_len = user.len().min(AUTH_FIELD_SIZE);
        let password_len = password.len().min(AUTH_FIELD_SIZE);
        bytes[..user_len].copy_from_slice(&user[..user_len]);
        bytes[AUTH_FIELD_SIZE..AUTH_FIELD_SIZE + password_len]
            .copy_from_slice(&password[..password_len]);
        bytes
    }

    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        if data.len() != AUTH_PAYLOAD_SIZE {
            return Err(PayloadError::Length {
                expected: AUTH_PAYLOAD_SIZE,
                actual: data.len(),
            });
        }
        let (user, password) = data.split_at(AUTH_FIELD_SIZE);
        Ok(Self {
            user: zero_padded_str(user),
            password: zero_padded_str(password),
        })
    }
}

fn zero_padded_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

pub fn encode_buffer_announcement(total_size: u32) -> [u8; 4] {
    total_size.to_le_bytes()
}

pub fn decode_buffer_announcement(data: &[u8]) -> Result<u32, PayloadError> {
    let bytes: [u8; 4] = data.try_into().map_err(|_| PayloadError::Length {
        expected: 4,
        actual: data.len(),
    })?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn decode_auth_result(data: &[u8]) -> Result<bool, PayloadError> {
    match data {
        [flag] => Ok(*flag != 0),
        _ => Err(PayloadError::Length {
            expected: 1,
            actual: data.len(),
        }),
    }
}
