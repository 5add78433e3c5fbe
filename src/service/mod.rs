//! Backend RPC services
//!
//! - `world`: channel presence, migration tokens, group chat hosting and
//!   event relay
//! - `channel`: delivery of relayed events and forced kicks to local sessions
//!
//! The world reaches channels through a [`PeerConnector`], which turns an
//! announced RPC address into a transport.

pub mod channel;
pub mod world;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::RpcError;
use crate::rpc::{ChannelTransport, RpcRequest, RpcResponse, RpcService, RpcTransport, TcpTransport};

pub use channel::ChannelService;
pub use world::{ChannelDirectory, RelayNotifier, WorldService};

/// Builds transports towards peers announced at runtime
pub trait PeerConnector: Send + Sync + 'static {
    fn connect(&self, rpc_address: &str) -> Arc<dyn RpcTransport>;
}

/// Connects over TCP
pub struct TcpConnector {
    max_frame_length: usize,
}

impl TcpConnector {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl PeerConnector for TcpConnector {
    fn connect(&self, rpc_address: &str) -> Arc<dyn RpcTransport> {
        Arc::new(TcpTransport::new(rpc_address, self.max_frame_length))
    }
}

/// Connects to services living in the same process
pub struct LocalConnector {
    services: DashMap<String, Arc<dyn RpcService>>,
    capacity: usize,
}

impl LocalConnector {
    pub fn new(capacity: usize) -> Self {
        Self {
            services: DashMap::new(),
            capacity,
        }
    }

    /// Make `service` reachable under `rpc_address`
    pub fn register(&self, rpc_address: impl Into<String>, service: Arc<dyn RpcService>) {
        self.services.insert(rpc_address.into(), service);
    }
}

impl PeerConnector for LocalConnector {
    fn connect(&self, rpc_address: &str) -> Arc<dyn RpcTransport> {
        match self.services.get(rpc_address) {
            Some(service) => Arc::new(ChannelTransport::pair(service.clone(), self.capacity)),
            None => Arc::new(Unreachable(rpc_address.to_string())),
        }
    }
}

/// Transport for an address nothing listens on
struct Unreachable(String);

#[async_trait]
impl RpcTransport for Unreachable {
    async fn request(&self, _request: RpcRequest) -> Result<RpcResponse, RpcError> {
        Err(RpcError::Unavailable(self.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::HeartbeatRequest;

    #[tokio::test]
    async fn test_local_connector_unknown_address() {
        let connector = LocalConnector::new(8);
        let transport = connector.connect("channel-9");
        let result = transport
            .request(HeartbeatRequest { sequence: 1 }.into())
            .await;
        assert_eq!(result, Err(RpcError::Unavailable("channel-9".into())));
    }
}
