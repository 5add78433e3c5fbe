//! World service
//!
//! The coordination process. Channels announce themselves here; login and
//! channel processes obtain and redeem migration tokens here; group chat
//! lives here, with group events relayed to whichever channels host the
//! receiving members.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RegistryError, RpcFault, RpcStatus};
use crate::group::{
    GroupErrorCode, GroupEvent, GroupNotifier, GroupRegistry, MemberInfo, RemovalReason,
};
use crate::rpc::{
    AnnouncePresenceRequest, AnnouncePresenceResponse, ClaimSessionRequest,
    ClaimSessionResponse, DisconnectRequest, DisconnectResponse, GroupChatCommand,
    GroupChatRequest, GroupChatResponse, HeartbeatResponse, LeaveGroupsRequest,
    LeaveGroupsResponse, RelayEventRequest, RpcGateway,
    RpcPolicies, RpcRequest, RpcResponse, RpcService, TransferSessionRequest,
    TransferSessionResponse, TransferTarget,
};
use crate::service::PeerConnector;

/// How long a migration token stays redeemable
pub const TOKEN_EXPIRY: Duration = Duration::from_secs(30);

/// Pending relays per channel before events are dropped
const RELAY_QUEUE: usize = 1024;

/// A registered channel process
#[derive(Clone)]
pub struct ChannelEntry {
    pub channel: u16,
    pub rpc_address: String,
    pub client_address: SocketAddr,
    pub gateway: RpcGateway,
    relay_tx: mpsc::Sender<RelayEventRequest>,
}

impl ChannelEntry {
    /// Queue a relay. Relays to one channel are delivered in queue order.
    fn relay(&self, request: RelayEventRequest) {
        if self.relay_tx.try_send(request).is_err() {
            warn!(channel = self.channel, "Relay queue full, dropping group event");
        }
    }
}

/// Live channel processes, by channel number
pub struct ChannelDirectory {
    channels: DashMap<u16, ChannelEntry>,
    connector: Arc<dyn PeerConnector>,
    policies: RpcPolicies,
}

impl ChannelDirectory {
    pub fn new(connector: Arc<dyn PeerConnector>, policies: RpcPolicies) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            connector,
            policies,
        })
    }

    /// Register (or replace) a channel. Returns every known channel.
    pub fn register(&self, request: &AnnouncePresenceRequest) -> Vec<u16> {
        let peer = format!("channel-{}", request.channel);
        let gateway = RpcGateway::new(
            &peer,
            self.connector.connect(&request.rpc_address),
            self.policies.clone(),
        );

        let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE);
        tokio::spawn(relay_worker(request.channel, gateway.clone(), relay_rx));

        let entry = ChannelEntry {
            channel: request.channel,
            rpc_address: request.rpc_address.clone(),
            client_address: request.client_address,
            gateway,
            relay_tx,
        };
        // Replacing an entry drops its relay sender, which stops the old worker
        self.channels.insert(request.channel, entry);

        info!(
            channel = request.channel,
            rpc_address = %request.rpc_address,
            client_address = %request.client_address,
            "Channel registered"
        );
        self.channels()
    }

    pub fn get(&self, channel: u16) -> Option<ChannelEntry> {
        self.channels.get(&channel).map(|e| e.clone())
    }

    /// Lowest-numbered channel
    pub fn first(&self) -> Option<ChannelEntry> {
        self.channels
            .iter()
            .min_by_key(|e| *e.key())
            .map(|e| e.value().clone())
    }

    pub fn remove(&self, channel: u16) -> bool {
        self.channels.remove(&channel).is_some()
    }

    /// Channel numbers, ascending
    pub fn channels(&self) -> Vec<u16> {
        let mut channels: Vec<u16> = self.channels.iter().map(|e| *e.key()).collect();
        channels.sort_unstable();
        channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn entries(&self) -> Vec<ChannelEntry> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }
}

async fn relay_worker(
    channel: u16,
    gateway: RpcGateway,
    mut relays: mpsc::Receiver<RelayEventRequest>,
) {
    while let Some(request) = relays.recv().await {
        let receivers = request.receivers.len();
        if let Err(e) = gateway.call(request).await {
            debug!(channel = channel, receivers = receivers, error = %e, "Relay failed");
        }
    }
    debug!(channel = channel, "Relay worker stopped");
}

/// Routes group events to the channels hosting each receiver
pub struct RelayNotifier {
    directory: Arc<ChannelDirectory>,
}

impl RelayNotifier {
    pub fn new(directory: Arc<ChannelDirectory>) -> Self {
        Self { directory }
    }
}

impl GroupNotifier for RelayNotifier {
    fn notify(&self, receivers: &[MemberInfo], event: &GroupEvent) {
        let mut by_channel: BTreeMap<u16, Vec<i64>> = BTreeMap::new();
        for member in receivers.iter().filter(|m| m.online) {
            by_channel.entry(member.channel).or_default().push(member.key);
        }

        for (channel, keys) in by_channel {
            match self.directory.get(channel) {
                Some(entry) => entry.relay(RelayEventRequest {
                    receivers: keys,
                    event: event.clone(),
                }),
                None => debug!(
                    channel = channel,
                    group_id = event.group_id(),
                    "No such channel for group event"
                ),
            }
        }
    }
}

struct MigrationGrant {
    account_id: i64,
    character_id: i64,
    machine_id: Uuid,
    channel: u16,
    expires_at: Instant,
}

impl MigrationGrant {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// World-side RPC service
pub struct WorldService {
    name: String,
    /// Where clients reconnect when migrating back to login
    login_address: SocketAddr,
    directory: Arc<ChannelDirectory>,
    tokens: DashMap<u64, MigrationGrant>,
    groups: Arc<GroupRegistry>,
}

impl WorldService {
    pub fn new(
        name: impl Into<String>,
        login_address: SocketAddr,
        directory: Arc<ChannelDirectory>,
        groups: Arc<GroupRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            login_address,
            directory,
            tokens: DashMap::new(),
            groups,
        }
    }

    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// Number of unredeemed tokens
    pub fn pending_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Drop expired tokens
    pub fn purge_expired_tokens(&self) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, grant| !grant.is_expired());
        before.saturating_sub(self.tokens.len())
    }

    /// Issue a fresh token that is not already outstanding
    fn issue_token(&self, grant: MigrationGrant) -> u64 {
        let mut grant = Some(grant);
        loop {
            let token: u64 = rand::random();
            if token == 0 {
                continue;
            }
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.tokens.entry(token) {
                if let Some(grant) = grant.take() {
                    slot.insert(grant);
                }
                return token;
            }
        }
    }

    fn transfer_session(
        &self,
        request: TransferSessionRequest,
    ) -> Result<TransferSessionResponse, RpcFault> {
        self.purge_expired_tokens();

        let (address, channel) = match request.target {
            TransferTarget::Login => (self.login_address, 0),
            TransferTarget::Channel(requested) => {
                let entry = match requested {
                    Some(channel) => self.directory.get(channel).ok_or_else(|| {
                        RpcFault::new(
                            RpcStatus::InvalidArgument,
                            format!("Migrating to invalid game channel: {}", channel),
                        )
                    })?,
                    None => self.directory.first().ok_or_else(|| {
                        RpcFault::new(RpcStatus::Unavailable, "No available game channels")
                    })?,
                };
                (entry.client_address, entry.channel)
            }
        };

        let token = self.issue_token(MigrationGrant {
            account_id: request.account_id,
            character_id: request.character_id,
            machine_id: request.machine_id,
            channel,
            expires_at: Instant::now() + TOKEN_EXPIRY,
        });

        info!(
            account_id = request.account_id,
            character_id = request.character_id,
            channel = channel,
            "Migration token issued"
        );
        Ok(TransferSessionResponse {
            address,
            token,
            channel,
        })
    }

    fn claim_session(&self, request: ClaimSessionRequest) -> Result<ClaimSessionResponse, RpcFault> {
        // Redeem only when every check passes; a failed claim leaves the token intact
        let redeemed = self.tokens.remove_if(&request.token, |_, grant| {
            !grant.is_expired()
                && grant.account_id == request.account_id
                && grant.machine_id == request.machine_id
        });
        if let Some((_, grant)) = redeemed {
            debug!(
                account_id = grant.account_id,
                character_id = grant.character_id,
                "Migration token redeemed"
            );
            return Ok(ClaimSessionResponse {
                character_id: grant.character_id,
                channel: grant.channel,
            });
        }

        let grant = self
            .tokens
            .get(&request.token)
            .filter(|grant| !grant.is_expired())
            .ok_or_else(|| RpcFault::new(RpcStatus::Unauthenticated, "Invalid token"))?;
        if grant.account_id != request.account_id {
            return Err(RpcFault::new(
                RpcStatus::PermissionDenied,
                "Invalid token for account",
            ));
        }
        Err(RpcFault::new(
            RpcStatus::FailedPrecondition,
            "Mismatched machine id for account",
        ))
    }

    fn group_chat(&self, request: GroupChatRequest) -> GroupChatResponse {
        let requester = request.requester;
        let key = requester.key;

        let result: Result<GroupChatResponse, RegistryError> = match request.command {
            GroupChatCommand::Create => self.groups.create(requester).map(|group_id| {
                let _ = self.groups.touch(group_id, key);
                GroupChatResponse {
                    group_id: Some(group_id),
                    ..Default::default()
                }
            }),
            GroupChatCommand::Join { group_id } => {
                self.groups.join(group_id, requester).map(|members| {
                    let _ = self.groups.touch(group_id, key);
                    GroupChatResponse {
                        group_id: Some(group_id),
                        members,
                        ..Default::default()
                    }
                })
            }
            GroupChatCommand::Leave { group_id } => self
                .groups
                .leave(group_id, key, RemovalReason::Left)
                .map(|_| GroupChatResponse {
                    group_id: Some(group_id),
                    ..Default::default()
                }),
            GroupChatCommand::Chat { group_id, message } => self
                .groups
                .chat(group_id, key, message)
                .map(|_| GroupChatResponse {
                    group_id: Some(group_id),
                    ..Default::default()
                }),
            GroupChatCommand::Disband { group_id } => self
                .groups
                .members(group_id)
                .and_then(|members| {
                    if members.iter().any(|m| m.key == key) {
                        self.groups.disband(group_id)
                    } else {
                        Err(RegistryError::MemberNotFound { group_id, key })
                    }
                })
                .map(|_| GroupChatResponse {
                    group_id: Some(group_id),
                    ..Default::default()
                }),
            GroupChatCommand::List => Ok(GroupChatResponse {
                groups: self.groups.groups_of(key),
                ..Default::default()
            }),
        };

        result.unwrap_or_else(|e| {
            debug!(key = key, error = %e, "Group chat request rejected");
            GroupChatResponse::error(GroupErrorCode::from(&e))
        })
    }

    /// A member's session ended: drop it from every group
    fn leave_groups(&self, request: LeaveGroupsRequest) -> LeaveGroupsResponse {
        let key = request.member.key;
        let groups = self.groups.leave_all(key, RemovalReason::Disconnected);
        if !groups.is_empty() {
            debug!(key = key, groups = ?groups, "Member left groups on disconnect");
        }
        LeaveGroupsResponse { groups }
    }

    /// Kick an account wherever it is connected
    async fn disconnect(&self, request: DisconnectRequest) -> DisconnectResponse {
        let calls = self
            .directory
            .entries()
            .into_iter()
            .map(|entry| {
                let request = request.clone();
                async move { entry.gateway.call(request).await }
            });

        let found = join_all(calls)
            .await
            .into_iter()
            .any(|result| matches!(result, Ok(DisconnectResponse { found: true })));
        DisconnectResponse { found }
    }
}

#[async_trait]
impl RpcService for WorldService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, RpcFault> {
        match request {
            RpcRequest::AnnouncePresence(request) => Ok(AnnouncePresenceResponse {
                channels: self.directory.register(&request),
            }
            .into()),
            RpcRequest::TransferSession(request) => self.transfer_session(request).map(Into::into),
            RpcRequest::ClaimSession(request) => self.claim_session(request).map(Into::into),
            RpcRequest::GroupChat(request) => Ok(self.group_chat(request).into()),
            RpcRequest::LeaveGroups(request) => Ok(self.leave_groups(request).into()),
            RpcRequest::Disconnect(request) => Ok(self.disconnect(request).await.into()),
            RpcRequest::Heartbeat(request) => Ok(HeartbeatResponse {
                sequence: request.sequence,
                server: self.name.clone(),
            }
            .into()),
            RpcRequest::RelayEvent(_) => Err(RpcFault::new(
                RpcStatus::InvalidArgument,
                "RelayEvent is served by channels",
            )),
        }
    }
}
