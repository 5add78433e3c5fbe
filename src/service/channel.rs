//! Channel service
//!
//! Served by each channel process for the world: relayed group events are
//! rendered per receiver and queued on the local session, and forced
//! disconnects kick whichever local session holds the account.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{RpcError, RpcFault, RpcStatus};
use crate::net::session::SessionManager;
use crate::protocol::packets;
use crate::rpc::{
    AnnouncePresenceRequest, DisconnectRequest, DisconnectResponse, HeartbeatResponse,
    RelayEventRequest, RelayEventResponse, RpcGateway, RpcRequest, RpcResponse, RpcService,
};

pub struct ChannelService {
    channel: u16,
    name: String,
    sessions: Arc<SessionManager>,
}

impl ChannelService {
    pub fn new(channel: u16, name: impl Into<String>, sessions: Arc<SessionManager>) -> Self {
        Self {
            channel,
            name: name.into(),
            sessions,
        }
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Queue an event on every receiver connected here. Returns how many were
    /// reached.
    fn relay(&self, request: RelayEventRequest) -> usize {
        let mut delivered = 0;
        for receiver in request.receivers {
            let Some(session) = self.sessions.get_by_character(receiver) else {
                continue;
            };
            let Some(packet) = packets::group_event(receiver, &request.event) else {
                continue;
            };
            if session.send(packet).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn disconnect(&self, request: DisconnectRequest) -> bool {
        match self.sessions.get_by_account(request.account_id) {
            Some(session) => {
                info!(
                    channel = self.channel,
                    session_id = session.id,
                    account_id = request.account_id,
                    reason = %request.reason,
                    "Kicking session"
                );
                let _ = session.send(packets::kick(&request.reason));
                session.disconnect();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RpcService for ChannelService {
    async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, RpcFault> {
        match request {
            RpcRequest::RelayEvent(request) => Ok(RelayEventResponse {
                delivered: self.relay(request),
            }
            .into()),
            RpcRequest::Disconnect(request) => Ok(DisconnectResponse {
                found: self.disconnect(request),
            }
            .into()),
            RpcRequest::Heartbeat(request) => Ok(HeartbeatResponse {
                sequence: request.sequence,
                server: self.name.clone(),
            }
            .into()),
            other => Err(RpcFault::new(
                RpcStatus::InvalidArgument,
                format!("{} is not served by channels", other.operation()),
            )),
        }
    }
}

/// Register a channel with the world. Returns the channels the world knows.
pub async fn announce(
    world: &RpcGateway,
    channel: u16,
    rpc_address: &str,
    client_address: SocketAddr,
) -> Result<Vec<u16>, RpcError> {
    let response = world
        .call(AnnouncePresenceRequest {
            channel,
            rpc_address: rpc_address.to_string(),
            client_address,
        })
        .await?;
    debug!(channel = channel, known = ?response.channels, "Presence announced");
    Ok(response.channels)
}
