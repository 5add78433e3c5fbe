//! Networking module
//!
//! This module handles all client-facing network functionality:
//! - Packet reading/writing and envelopes
//! - Opcode dispatch with per-session serialization
//! - Session state and the session registry
//! - Framing and the per-connection lifecycle

pub mod buffer;
pub mod dispatch;
pub mod handler;
pub mod packet;
pub mod session;
pub mod transport;
