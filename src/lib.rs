//! Realmgate Server Library
//!
//! Networking and coordination core for a multi-process game backend: a login
//! tier that authenticates clients and hands them off, a world tier that
//! coordinates channels and hosts group chat, and channel tiers that run the
//! game loop.
//!
//! ## Modules
//!
//! - `net` - Packet reading, dispatch, sessions and connection handling
//! - `rpc` - Typed inter-process calls and their transports
//! - `group` - Concurrent group membership with idle eviction
//! - `ai` - Per-entity task scheduling
//! - `service` - World and channel RPC services
//! - `protocol` - Opcodes, packet builders and handlers
//! - `auth` - Credential checks
//! - `game` - Persistence collaborator and the tick loop
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions

pub mod ai;
pub mod auth;
pub mod config;
pub mod error;
pub mod game;
pub mod group;
pub mod net;
pub mod protocol;
pub mod rpc;
pub mod service;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{RealmgateError, Result};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
