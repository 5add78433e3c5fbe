//! Error handling module
//!
//! Defines custom error types for the Realmgate server. Each concern has its
//! own error enum; they all fold into [`RealmgateError`].

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::session::SessionState;
use crate::rpc::Operation;

/// Main error type for the Realmgate server
#[derive(Error, Debug)]
pub enum RealmgateError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Malformed or unexpected payloads
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Packet arrived while the session was in the wrong state
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Dispatch table configuration errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Inter-process call failures
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Group and entity registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Task scheduler errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Persistence collaborator errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Outbound queue full for session {0}")]
    OutboundFull(u64),
}

/// Decode failures raised while reading a packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Packet too short to carry an opcode ({0} bytes)")]
    MissingOpcode(usize),

    #[error("Invalid string encoding")]
    InvalidStringEncoding,

    #[error("Unknown command {command} for opcode {opcode:#06x}")]
    UnknownCommand { opcode: u16, command: u8 },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

/// Session state violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Opcode {opcode:#06x} not accepted in state {state}")]
    UnsupportedState { opcode: u16, state: SessionState },

    #[error("Illegal session transition {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

/// Startup-time dispatch table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Opcode {0:#06x} registered twice")]
    DuplicateOpcode(u16),
}

/// Status codes carried by a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    InvalidArgument,
    NotFound,
    Unauthenticated,
    PermissionDenied,
    FailedPrecondition,
    Unavailable,
    Internal,
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A failure reported by the serving side of an RPC
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcFault {
    pub code: RpcStatus,
    pub message: String,
}

impl RpcFault {
    pub fn new(code: RpcStatus, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Inter-process call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: Operation, after: Duration },

    #[error("Remote failure: {0}")]
    Remote(RpcFault),

    #[error("Call cancelled by session teardown")]
    Cancelled,

    #[error("Unexpected response for {0}")]
    UnexpectedResponse(Operation),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("{0} waits for its response and cannot be sent fire-and-forget")]
    NotFireAndForget(Operation),
}

impl RpcError {
    /// Remote status code, if the peer answered with a failure
    pub fn status(&self) -> Option<RpcStatus> {
        match self {
            RpcError::Remote(fault) => Some(fault.code),
            _ => None,
        }
    }
}

impl From<RpcFault> for RpcError {
    fn from(fault: RpcFault) -> Self {
        RpcError::Remote(fault)
    }
}

/// Group and entity registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Member {key} already in group {group_id}")]
    Conflict { group_id: u64, key: i64 },

    #[error("Group {0} not found")]
    NotFound(u64),

    #[error("Member {key} not found in group {group_id}")]
    MemberNotFound { group_id: u64, key: i64 },

    #[error("Entity {0} already registered")]
    EntityExists(u64),

    #[error("Entity {0} not found")]
    EntityNotFound(u64),

    #[error("Limit reached: {0}")]
    ResourceExhausted(GroupLimit),
}

/// Which group capacity limit was hit
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLimit {
    #[error("group {group_id} is full ({max} members)")]
    GroupFull { group_id: u64, max: usize },

    #[error("member {key} is already in {max} groups")]
    TooManyGroups { key: i64, max: usize },
}

/// Task scheduler errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
}

/// Authentication-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Account locked")]
    AccountLocked,

    #[error("Already logged in")]
    AlreadyLoggedIn,

    #[error("Character not owned by account")]
    CharacterNotOwned,

    #[error("Invalid username format")]
    InvalidUsername,

    #[error("Invalid password format")]
    InvalidPassword,

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
}

/// Persistence collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Storage backend failure: {0}")]
    Backend(String),
}

/// Result type alias for Realmgate operations
pub type Result<T> = std::result::Result<T, RealmgateError>;

/// Response codes for the login result packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginResponse {
    /// Successful login
    Success = 0,
    /// Invalid username or password
    InvalidCredentials = 1,
    /// Account is disabled
    AccountDisabled = 2,
    /// Account is locked
    AccountLocked = 3,
    /// Account is already logged in
    AlreadyLoggedIn = 4,
    /// Could not complete login
    CouldNotCompleteLogin = 5,
    /// No backend server available
    ServerUnavailable = 6,
}

impl LoginResponse {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<&AuthError> for LoginResponse {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => LoginResponse::InvalidCredentials,
            AuthError::AccountDisabled => LoginResponse::AccountDisabled,
            AuthError::AccountLocked => LoginResponse::AccountLocked,
            AuthError::AlreadyLoggedIn => LoginResponse::AlreadyLoggedIn,
            _ => LoginResponse::CouldNotCompleteLogin,
        }
    }
}

/// Result codes for the migration (handoff) packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationResponse {
    Ok = 0,
    ChannelUnavailable = 1,
    InvalidChannel = 2,
    InvalidToken = 3,
    Timeout = 4,
    Failed = 5,
}

impl MigrationResponse {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<&RpcError> for MigrationResponse {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Timeout { .. } => MigrationResponse::Timeout,
            RpcError::Unavailable(_) => MigrationResponse::ChannelUnavailable,
            RpcError::Remote(fault) => match fault.code {
                RpcStatus::Unavailable => MigrationResponse::ChannelUnavailable,
                RpcStatus::InvalidArgument => MigrationResponse::InvalidChannel,
                RpcStatus::Unauthenticated
                | RpcStatus::PermissionDenied
                | RpcStatus::FailedPrecondition => MigrationResponse::InvalidToken,
                _ => MigrationResponse::Failed,
            },
            _ => MigrationResponse::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_response_conversion() {
        assert_eq!(LoginResponse::Success.as_u8(), 0);
        assert_eq!(LoginResponse::InvalidCredentials.as_u8(), 1);
        assert_eq!(LoginResponse::ServerUnavailable.as_u8(), 6);
    }

    #[test]
    fn test_auth_error_to_login_response() {
        let response: LoginResponse = (&AuthError::InvalidCredentials).into();
        assert_eq!(response, LoginResponse::InvalidCredentials);

        let response: LoginResponse = (&AuthError::RegistrationFailed("x".into())).into();
        assert_eq!(response, LoginResponse::CouldNotCompleteLogin);
    }

    #[test]
    fn test_rpc_error_to_migration_response() {
        let timeout = RpcError::Timeout {
            operation: Operation::TransferSession,
            after: Duration::from_millis(100),
        };
        assert_eq!(MigrationResponse::from(&timeout), MigrationResponse::Timeout);

        let denied = RpcError::Remote(RpcFault::new(RpcStatus::PermissionDenied, "nope"));
        assert_eq!(MigrationResponse::from(&denied), MigrationResponse::InvalidToken);
        assert_eq!(denied.status(), Some(RpcStatus::PermissionDenied));
    }

    #[test]
    fn test_error_display() {
        let err = NetworkError::ConnectionClosed;
        assert_eq!(err.to_string(), "Connection closed");

        let err = DispatchError::DuplicateOpcode(0x12);
        assert_eq!(err.to_string(), "Opcode 0x0012 registered twice");

        let err = RegistryError::Conflict {
            group_id: 3,
            key: 100,
        };
        assert_eq!(err.to_string(), "Member 100 already in group 3");

        let err = ProtocolError::UnexpectedEof {
            needed: 4,
            remaining: 1,
        };
        assert_eq!(
            err.to_string(),
            "Unexpected end of packet: needed 4 bytes, 1 remaining"
        );
    }
}
