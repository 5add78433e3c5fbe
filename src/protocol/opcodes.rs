//! Wire opcodes
//!
//! Inbound (client -> server) and outbound (server -> client) opcode tables.

/// Client -> server opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecvOp {
    /// Client version and machine id, first packet on every tier
    ResponseVersion = 0x0001,
    /// Credentials (login tier)
    ResponseLogin = 0x0002,
    /// Migration token (game tier)
    ResponseKey = 0x0003,
    ResponseHeartbeat = 0x0004,
    /// Select/create character (login tier)
    CharacterManagement = 0x0009,
    GroupChat = 0x0020,
}

impl RecvOp {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(opcode: u16) -> Option<Self> {
        match opcode {
            0x0001 => Some(RecvOp::ResponseVersion),
            0x0002 => Some(RecvOp::ResponseLogin),
            0x0003 => Some(RecvOp::ResponseKey),
            0x0004 => Some(RecvOp::ResponseHeartbeat),
            0x0009 => Some(RecvOp::CharacterManagement),
            0x0020 => Some(RecvOp::GroupChat),
            _ => None,
        }
    }
}

/// Server -> client opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SendOp {
    LoginResult = 0x0001,
    CharacterList = 0x0002,
    /// Endpoint and token for the game channel
    LoginToGame = 0x0003,
    /// Outcome of redeeming a migration token
    MoveResult = 0x0004,
    RequestHeartbeat = 0x0005,
    /// Server-initiated disconnect notice
    Kick = 0x0006,
    ServerList = 0x0007,
    GroupChat = 0x0020,
}

impl SendOp {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}
