//! Realmgate Server
//!
//! Runs the login, world and channel tiers, either all in one process
//! (`mode = "standalone"`) or one tier per process talking over TCP RPC.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use realmgate_server::config::{ServerConfig, ServerMode};
use realmgate_server::game::persistence::{MemoryStorage, Storage};
use realmgate_server::net::handler::ConnectionHandler;
use realmgate_server::rpc::{serve_tcp, ChannelTransport, RpcTransport, TcpTransport};
use realmgate_server::service::{LocalConnector, TcpConnector};
use realmgate_server::state::{AppState, ChannelNode, LoginNode, WorldNode};
use realmgate_server::VERSION;

/// Delay between attempts to reach the world process
const ANNOUNCE_RETRY: Duration = Duration::from_secs(2);

/// In-process address the standalone channel is reachable under
const LOCAL_CHANNEL: &str = "local:channel";

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load().await?;
    init_logging(config.log_json);

    info!(version = VERSION, mode = ?config.mode, "Realmgate server starting");
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    let mut state = AppState::new(config.clone());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    match config.mode {
        ServerMode::Standalone => {
            let connector = Arc::new(LocalConnector::new(config.rpc.queue_capacity));
            let world = WorldNode::new(&config, connector.clone())?;
            let world_link = || -> Arc<dyn RpcTransport> {
                Arc::new(ChannelTransport::pair(
                    world.service.clone(),
                    config.rpc.queue_capacity,
                ))
            };

            let login = LoginNode::new(&config, storage.clone(), world_link())?;
            let channel = ChannelNode::new(&config, storage.clone(), world_link())?;
            connector.register(LOCAL_CHANNEL, channel.service.clone());

            let client_address = config.public_addr(config.channel_port())?;
            channel.announce(LOCAL_CHANNEL, client_address).await?;

            state.world = Some(world);
            state.login = Some(login);
            state.channel = Some(channel);
        }
        ServerMode::World => {
            let connector = Arc::new(TcpConnector::new(config.rpc.max_frame_length));
            let world = WorldNode::new(&config, connector)?;

            let listener = TcpListener::bind(config.bind_addr(config.world_rpc_port)).await?;
            tasks.push(tokio::spawn(serve_tcp(
                listener,
                world.service.clone(),
                state.shutdown.clone(),
                config.rpc.max_frame_length,
            )));
            state.world = Some(world);
        }
        ServerMode::Login => {
            let transport = world_transport(&config);
            state.login = Some(LoginNode::new(&config, storage.clone(), transport)?);
        }
        ServerMode::Channel => {
            let channel = ChannelNode::new(&config, storage.clone(), world_transport(&config))?;

            let listener = TcpListener::bind(config.bind_addr(config.channel_rpc_port())).await?;
            tasks.push(tokio::spawn(serve_tcp(
                listener,
                channel.service.clone(),
                state.shutdown.clone(),
                config.rpc.max_frame_length,
            )));
            state.channel = Some(channel);
        }
    }

    let state = Arc::new(state);

    if let Some(login) = &state.login {
        let listener = TcpListener::bind(config.bind_addr(config.login_port)).await?;
        info!("Login server listening on: {}", listener.local_addr()?);
        tasks.push(tokio::spawn(accept_connections(
            "login",
            listener,
            login.connection_handler(),
            state.shutdown.clone(),
        )));
    }

    if let Some(channel) = &state.channel {
        let listener = TcpListener::bind(config.bind_addr(config.channel_port())).await?;
        info!(
            channel = channel.channel,
            "Channel server listening on: {}",
            listener.local_addr()?
        );
        tasks.push(tokio::spawn(accept_connections(
            "channel",
            listener,
            channel.connection_handler(),
            state.shutdown.clone(),
        )));

        let world_loop = state.clone();
        tasks.push(tokio::spawn(async move {
            if let Some(channel) = &world_loop.channel {
                channel.game_world.run(world_loop.shutdown.clone()).await;
            }
        }));

        if config.mode == ServerMode::Channel {
            let announcer = state.clone();
            tasks.push(tokio::spawn(async move {
                announce_until_registered(&announcer).await;
            }));
        }
    }

    info!("Server startup complete!");

    wait_for_shutdown(state.shutdown.clone()).await;
    info!("Shutting down server...");

    state.disconnect_all();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,realmgate_server=debug"));

    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(false)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .init();
    }
}

fn world_transport(config: &ServerConfig) -> Arc<dyn RpcTransport> {
    Arc::new(TcpTransport::new(
        config.rpc.world_address.clone(),
        config.rpc.max_frame_length,
    ))
}

/// Keep announcing until the world accepts this channel
async fn announce_until_registered(state: &AppState) {
    let Some(channel) = &state.channel else {
        return;
    };
    let config = &state.config;
    let (rpc_address, client_address) = match (
        config.public_addr(config.channel_rpc_port()),
        config.public_addr(config.channel_port()),
    ) {
        (Ok(rpc), Ok(client)) => (rpc.to_string(), client),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Cannot build channel addresses");
            return;
        }
    };

    loop {
        match channel.announce(&rpc_address, client_address).await {
            Ok(channels) => {
                info!(channel = channel.channel, known = ?channels, "Registered with world");
                return;
            }
            Err(e) => warn!(error = %e, "World unreachable, retrying"),
        }
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = tokio::time::sleep(ANNOUNCE_RETRY) => {}
        }
    }
}

/// Accept incoming client connections
async fn accept_connections(
    tier: &'static str,
    listener: TcpListener,
    handler: ConnectionHandler,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        info!(tier = tier, "New connection from: {}", addr);
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.handle_tcp(stream, addr).await {
                                warn!(tier = tier, "Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!(tier = tier, "Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!(tier = tier, "Connection acceptor shutting down");
                break;
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM, then fire the shutdown token
async fn wait_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}
