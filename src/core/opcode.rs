//! Transport opcodes of the login session protocol.
//!
//! Opcodes are the first two bytes of every datagram, big-endian. Only the ones
//! the proxy acts on get their own variant; everything else is carried through
//! as [`Opcode::Unknown`] and forwarded untouched.

/// Application opcode of the server listing, carried inside a first fragment.
/// Stored little-endian on the wire, unlike transport opcodes.
pub const APP_OP_SERVER_LIST_RESPONSE: u16 = 0x0018;

/// Transport-level opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    SessionRequest,
    SessionResponse,
    Combined,
    SessionDisconnect,
    KeepAlive,
    Packet,
    Fragment,
    Ack,
    Unknown(u16),
}

impl Opcode {
    pub const fn as_u16(self) -> u16 {
        match self {
            Opcode::SessionRequest => 0x0001,
            Opcode::SessionResponse => 0x0002,
            Opcode::Combined => 0x0003,
            Opcode::SessionDisconnect => 0x0005,
            Opcode::KeepAlive => 0x0006,
            Opcode::Packet => 0x0009,
            Opcode::Fragment => 0x000d,
            Opcode::Ack => 0x0015,
            Opcode::Unknown(raw) => raw,
        }
    }

    /// Whether the two bytes after the opcode are a sequence number.
    pub const fn is_sequenced(self) -> bool {
        matches!(self, Opcode::Packet | Opcode::Fragment | Opcode::Ack)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::SessionRequest => "OP_SessionRequest",
            Opcode::SessionResponse => "OP_SessionResponse",
            Opcode::Combined => "OP_Combined",
            Opcode::SessionDisconnect => "OP_SessionDisconnect",
            Opcode::KeepAlive => "OP_KeepAlive",
            Opcode::Packet => "OP_Packet",
            Opcode::Fragment => "OP_Fragment",
            Opcode::Ack => "OP_Ack",
            Opcode::Unknown(_) => "OP_Unknown",
        }
    }
}

impl From<u16> for Opcode {
    fn from(raw: u16) -> Self {
        match raw {
            0x0001 => Opcode::SessionRequest,
            0x0002 => Opcode::SessionResponse,
            0x0003 => Opcode::Combined,
            0x0005 => Opcode::SessionDisconnect,
            0x0006 => Opcode::KeepAlive,
            0x0009 => Opcode::Packet,
            0x000d => Opcode::Fragment,
            0x0015 => Opcode::Ack,
            other => Opcode::Unknown(other),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:04x})", self.name(), self.as_u16())
    }
}
