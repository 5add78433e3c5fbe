//! Application state module
//!
//! Wiring for each process tier. A node owns the registries, services and
//! dispatch table of one tier; `AppState` holds whichever nodes this process
//! runs.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ai::EntityTable;
use crate::auth::AuthService;
use crate::config::ServerConfig;
use crate::error::{RealmgateError, Result};
use crate::game::persistence::Storage;
use crate::game::world::GameWorld;
use crate::group::GroupRegistry;
use crate::net::dispatch::DispatchTable;
use crate::net::handler::ConnectionHandler;
use crate::net::session::{ProcessTier, SessionManager};
use crate::protocol::{game_table, login_table, GameContext, LoginContext};
use crate::rpc::{RpcGateway, RpcTransport};
use crate::service::channel::announce;
use crate::service::{ChannelDirectory, ChannelService, PeerConnector, RelayNotifier, WorldService};

fn config_error(e: anyhow::Error) -> RealmgateError {
    RealmgateError::Config(e.to_string())
}

/// Login tier: credentials, characters, handoff
pub struct LoginNode {
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<AuthService>,
    pub world: RpcGateway,
    handler: ConnectionHandler,
}

impl LoginNode {
    pub fn new(
        config: &ServerConfig,
        storage: Arc<dyn Storage>,
        world_transport: Arc<dyn RpcTransport>,
    ) -> Result<Self> {
        let sessions = Arc::new(SessionManager::with_limits(
            ProcessTier::Login,
            config.session_limits(),
        ));
        let auth = Arc::new(AuthService::new(storage, config.dev_mode));
        if config.dev_mode {
            info!("Auth service running in DEVELOPMENT mode - all logins accepted");
        }
        let world = RpcGateway::new("world", world_transport, config.rpc_policies());

        let context = Arc::new(LoginContext {
            server_name: config.server_name.clone(),
            auth: auth.clone(),
            sessions: sessions.clone(),
            world: world.clone(),
            endpoints: vec![config
                .public_addr(config.channel_port())
                .map_err(config_error)?],
        });
        let table = Arc::new(login_table(context)?);
        let handler = ConnectionHandler::new(
            sessions.clone(),
            table,
            config.session.inbound_capacity,
            config.max_frame_length,
        );

        Ok(Self {
            sessions,
            auth,
            world,
            handler,
        })
    }

    pub fn connection_handler(&self) -> ConnectionHandler {
        self.handler.clone()
    }
}

/// World tier: presence, migration tokens, group chat
pub struct WorldNode {
    pub service: Arc<WorldService>,
}

impl WorldNode {
    pub fn new(config: &ServerConfig, connector: Arc<dyn PeerConnector>) -> Result<Self> {
        let directory = ChannelDirectory::new(connector, config.rpc_policies());
        let groups = GroupRegistry::new(
            config.group_limits(),
            config.group_idle_timeout(),
            Arc::new(RelayNotifier::new(directory.clone())),
        );
        let login_address = config
            .public_addr(config.login_port)
            .map_err(config_error)?;

        Ok(Self {
            service: Arc::new(WorldService::new(
                config.server_name.clone(),
                login_address,
                directory,
                groups,
            )),
        })
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        self.service.groups()
    }
}

/// Channel tier: sessions in play, entities, the tick loop
pub struct ChannelNode {
    pub channel: u16,
    pub sessions: Arc<SessionManager>,
    pub entities: Arc<EntityTable>,
    pub game_world: Arc<GameWorld>,
    pub service: Arc<ChannelService>,
    pub world: RpcGateway,
    table: Arc<DispatchTable>,
    handler: ConnectionHandler,
}

impl ChannelNode {
    pub fn new(
        config: &ServerConfig,
        storage: Arc<dyn Storage>,
        world_transport: Arc<dyn RpcTransport>,
    ) -> Result<Self> {
        let channel = config.channel_id;
        let sessions = Arc::new(SessionManager::with_limits(
            ProcessTier::Channel,
            config.session_limits(),
        ));
        let entities = EntityTable::new(config.world.task_queue_capacity);
        let game_world = Arc::new(GameWorld::new(
            config.world_settings(),
            entities.clone(),
            sessions.clone(),
        ));
        let world = RpcGateway::new("world", world_transport, config.rpc_policies());
        let service = Arc::new(ChannelService::new(
            channel,
            format!("{}-ch{}", config.server_name, channel),
            sessions.clone(),
        ));

        let context = Arc::new(GameContext {
            channel,
            sessions: sessions.clone(),
            entities: entities.clone(),
            storage,
            world: world.clone(),
            game_world: game_world.clone(),
        });
        let table = Arc::new(game_table(context)?);
        let handler = ConnectionHandler::new(
            sessions.clone(),
            table.clone(),
            config.session.inbound_capacity,
            config.max_frame_length,
        );

        Ok(Self {
            channel,
            sessions,
            entities,
            game_world,
            service,
            world,
            table,
            handler,
        })
    }

    pub fn connection_handler(&self) -> ConnectionHandler {
        self.handler.clone()
    }

    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    /// Register this channel with the world
    pub async fn announce(&self, rpc_address: &str, client_address: SocketAddr) -> Result<Vec<u16>> {
        Ok(announce(&self.world, self.channel, rpc_address, client_address).await?)
    }
}

/// Application state shared across all connections
pub struct AppState {
    pub config: ServerConfig,
    pub login: Option<LoginNode>,
    pub world: Option<WorldNode>,
    pub channel: Option<ChannelNode>,
    /// Fired once on shutdown; every listener and loop watches it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            login: None,
            world: None,
            channel: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Disconnect every client session this process holds
    pub fn disconnect_all(&self) {
        if let Some(login) = &self.login {
            login.sessions.disconnect_all();
        }
        if let Some(channel) = &self.channel {
            channel.sessions.disconnect_all();
        }
    }
}
