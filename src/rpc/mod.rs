//! Inter-process RPC
//!
//! Typed request/response operations between the login, world and channel
//! processes:
//! - `Operation` names each call and carries its default delivery policy
//! - request/response payloads are plain serde types, bundled into
//!   [`RpcRequest`] / [`RpcResponse`] for the wire
//! - [`gateway::RpcGateway`] applies timeouts, delivery mode and cancellation
//! - [`transport`] provides the in-process and TCP transports

pub mod gateway;
pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RpcError, RpcFault};
use crate::group::{GroupErrorCode, GroupEvent, MemberInfo};

pub use gateway::RpcGateway;
pub use transport::{serve_tcp, ChannelTransport, TcpTransport};

/// Every RPC operation in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    AnnouncePresence,
    TransferSession,
    ClaimSession,
    RelayEvent,
    Disconnect,
    Heartbeat,
    GroupChat,
    LeaveGroups,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::AnnouncePresence,
        Operation::TransferSession,
        Operation::ClaimSession,
        Operation::RelayEvent,
        Operation::Disconnect,
        Operation::Heartbeat,
        Operation::GroupChat,
        Operation::LeaveGroups,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::AnnouncePresence => "AnnouncePresence",
            Operation::TransferSession => "TransferSession",
            Operation::ClaimSession => "ClaimSession",
            Operation::RelayEvent => "RelayEvent",
            Operation::Disconnect => "Disconnect",
            Operation::Heartbeat => "Heartbeat",
            Operation::GroupChat => "GroupChat",
            Operation::LeaveGroups => "LeaveGroups",
        }
    }

    /// Built-in delivery mode and timeout
    pub fn default_policy(&self) -> OperationPolicy {
        use DeliveryMode::*;
        let (mode, millis) = match self {
            Operation::AnnouncePresence => (Synchronous, 2_000),
            Operation::TransferSession => (Synchronous, 3_000),
            Operation::ClaimSession => (Synchronous, 3_000),
            Operation::RelayEvent => (FireAndForget, 1_000),
            Operation::Disconnect => (FireAndForget, 1_000),
            Operation::Heartbeat => (Synchronous, 1_000),
            Operation::GroupChat => (Synchronous, 2_000),
            Operation::LeaveGroups => (FireAndForget, 1_000),
        };
        OperationPolicy {
            mode,
            timeout: Duration::from_millis(millis),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the caller waits for the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Synchronous,
    FireAndForget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub mode: DeliveryMode,
    pub timeout: Duration,
}

/// Per-operation policies with configurable timeouts
#[derive(Debug, Clone)]
pub struct RpcPolicies {
    policies: HashMap<Operation, OperationPolicy>,
}

impl RpcPolicies {
    pub fn get(&self, operation: Operation) -> OperationPolicy {
        self.policies
            .get(&operation)
            .copied()
            .unwrap_or_else(|| operation.default_policy())
    }

    /// Override one operation's timeout
    pub fn with_timeout(mut self, operation: Operation, timeout: Duration) -> Self {
        let mut policy = self.get(operation);
        policy.timeout = timeout;
        self.policies.insert(operation, policy);
        self
    }
}

impl Default for RpcPolicies {
    fn default() -> Self {
        Self {
            policies: Operation::ALL
                .iter()
                .map(|op| (*op, op.default_policy()))
                .collect(),
        }
    }
}

// ============ Payloads ============

/// Channel process registering its endpoints with the world
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePresenceRequest {
    pub channel: u16,
    /// Where the world reaches the channel's RPC server
    pub rpc_address: String,
    /// Where clients connect
    pub client_address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePresenceResponse {
    pub channels: Vec<u16>,
}

/// Which process a migrating session is headed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferTarget {
    Login,
    /// A game channel; `None` picks the first available
    Channel(Option<u16>),
}

/// Issue a migration token (migrate out)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSessionRequest {
    pub account_id: i64,
    pub character_id: i64,
    pub machine_id: Uuid,
    pub target: TransferTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSessionResponse {
    pub address: SocketAddr,
    pub token: u64,
    pub channel: u16,
}

/// Redeem a migration token (migrate in)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSessionRequest {
    pub account_id: i64,
    pub token: u64,
    pub machine_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSessionResponse {
    pub character_id: i64,
    pub channel: u16,
}

/// Deliver a group event to members hosted on the receiving channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEventRequest {
    pub receivers: Vec<i64>,
    pub event: GroupEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEventResponse {
    pub delivered: usize,
}

/// Forced kick of an account's session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub account_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub sequence: u64,
    pub server: String,
}

/// Group chat command issued on behalf of a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupChatCommand {
    Create,
    Join { group_id: u64 },
    Leave { group_id: u64 },
    Chat { group_id: u64, message: String },
    Disband { group_id: u64 },
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChatRequest {
    pub requester: MemberInfo,
    pub command: GroupChatCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupChatResponse {
    pub group_id: Option<u64>,
    pub members: Vec<MemberInfo>,
    /// Groups the requester belongs to (for `List`)
    pub groups: Vec<u64>,
    pub error: Option<GroupErrorCode>,
}

/// Session teardown: drop a member from every group it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroupsRequest {
    pub member: MemberInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroupsResponse {
    pub groups: Vec<u64>,
}

impl GroupChatResponse {
    pub fn error(code: GroupErrorCode) -> Self {
        Self {
            error: Some(code),
            ..Self::default()
        }
    }
}

// ============ Wire envelopes ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body")]
pub enum RpcRequest {
    AnnouncePresence(AnnouncePresenceRequest),
    TransferSession(TransferSessionRequest),
    ClaimSession(ClaimSessionRequest),
    RelayEvent(RelayEventRequest),
    Disconnect(DisconnectRequest),
    Heartbeat(HeartbeatRequest),
    GroupChat(GroupChatRequest),
    LeaveGroups(LeaveGroupsRequest),
}

impl RpcRequest {
    pub fn operation(&self) -> Operation {
        match self {
            RpcRequest::AnnouncePresence(_) => Operation::AnnouncePresence,
            RpcRequest::TransferSession(_) => Operation::TransferSession,
            RpcRequest::ClaimSession(_) => Operation::ClaimSession,
            RpcRequest::RelayEvent(_) => Operation::RelayEvent,
            RpcRequest::Disconnect(_) => Operation::Disconnect,
            RpcRequest::Heartbeat(_) => Operation::Heartbeat,
            RpcRequest::GroupChat(_) => Operation::GroupChat,
            RpcRequest::LeaveGroups(_) => Operation::LeaveGroups,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body")]
pub enum RpcResponse {
    AnnouncePresence(AnnouncePresenceResponse),
    TransferSession(TransferSessionResponse),
    ClaimSession(ClaimSessionResponse),
    RelayEvent(RelayEventResponse),
    Disconnect(DisconnectResponse),
    Heartbeat(HeartbeatResponse),
    GroupChat(GroupChatResponse),
    LeaveGroups(LeaveGroupsResponse),
}

/// A request frame on the TCP transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: RpcRequest,
}

/// A response frame on the TCP transport, paired by `id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub result: Result<RpcResponse, RpcFault>,
}

/// Ties a request payload to its operation and response type
pub trait RpcCall: Into<RpcRequest> + Send + 'static {
    const OPERATION: Operation;
    type Response: Send + 'static;

    fn extract(response: RpcResponse) -> Option<Self::Response>;
}

macro_rules! rpc_calls {
    ($($op:ident: $req:ty => $resp:ty;)*) => {
        $(
            impl From<$req> for RpcRequest {
                fn from(request: $req) -> Self {
                    RpcRequest::$op(request)
                }
            }

            impl From<$resp> for RpcResponse {
                fn from(response: $resp) -> Self {
                    RpcResponse::$op(response)
                }
            }

            impl RpcCall for $req {
                const OPERATION: Operation = Operation::$op;
                type Response = $resp;

                fn extract(response: RpcResponse) -> Option<$resp> {
                    match response {
                        RpcResponse::$op(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )*
    };
}

rpc_calls! {
    AnnouncePresence: AnnouncePresenceRequest => AnnouncePresenceResponse;
    TransferSession: TransferSessionRequest => TransferSessionResponse;
    ClaimSession: ClaimSessionRequest => ClaimSessionResponse;
    RelayEvent: RelayEventRequest => RelayEventResponse;
    Disconnect: DisconnectRequest => DisconnectResponse;
    Heartbeat: HeartbeatRequest => HeartbeatResponse;
    GroupChat: GroupChatRequest => GroupChatResponse;
    LeaveGroups: LeaveGroupsRequest => LeaveGroupsResponse;
}

/// Server side of the RPC contract
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, RpcFault>;
}

/// Client side: moves one request to a peer and returns its response
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn request(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policies() {
        let policies = RpcPolicies::default();
        assert_eq!(
            policies.get(Operation::TransferSession).timeout,
            Duration::from_secs(3)
        );
        assert_eq!(
            policies.get(Operation::RelayEvent).mode,
            DeliveryMode::FireAndForget
        );

        let policies = policies.with_timeout(Operation::Heartbeat, Duration::from_millis(100));
        assert_eq!(
            policies.get(Operation::Heartbeat),
            OperationPolicy {
                mode: DeliveryMode::Synchronous,
                timeout: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn test_extract_checks_operation() {
        let response: RpcResponse = HeartbeatResponse {
            sequence: 1,
            server: "world".into(),
        }
        .into();
        assert!(ClaimSessionRequest::extract(response.clone()).is_none());
        assert_eq!(HeartbeatRequest::extract(response).unwrap().sequence, 1);
    }

    #[test]
    fn test_request_frame_json() {
        let frame = RequestFrame {
            id: 9,
            request: DisconnectRequest {
                account_id: 5,
                reason: "kick".into(),
            }
            .into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let decoded: RequestFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.request.operation(), Operation::Disconnect);
    }
}
