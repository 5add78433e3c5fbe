//! Packet envelope
//!
//! A decoded frame: a u16 little-endian opcode followed by an opaque payload.

use bytes::{Buf, Bytes};

use crate::error::ProtocolError;
use crate::net::buffer::PacketReader;

/// Immutable opcode + payload pair handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub opcode: u16,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(opcode: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Split a raw frame into its opcode and payload
    pub fn decode(mut frame: Bytes) -> Result<Self, ProtocolError> {
        if frame.len() < 2 {
            return Err(ProtocolError::MissingOpcode(frame.len()));
        }
        let opcode = frame.get_u16_le();
        Ok(Self {
            opcode,
            payload: frame,
        })
    }

    /// Reader positioned at the start of the payload
    pub fn reader(&self) -> PacketReader {
        PacketReader::new(self.payload.clone())
    }
}
