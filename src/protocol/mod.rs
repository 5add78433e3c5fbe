//! Protocol module
//!
//! Concrete opcodes and handlers:
//! - `opcodes`: inbound and outbound opcode tables
//! - `packets`: outbound packet builders
//! - `login`: login tier (version check, credentials, characters, handoff)
//! - `game`: channel tier (token redemption, heartbeat, group chat)

pub mod game;
pub mod login;
pub mod opcodes;
pub mod packets;

pub use game::{game_table, GameContext};
pub use login::{login_table, LoginContext};
