//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::game::world::WorldSettings;
use crate::group::GroupLimits;
use crate::net::buffer::MAX_PACKET_SIZE;
use crate::net::session::SessionLimits;
use crate::rpc::transport::MAX_RPC_FRAME;
use crate::rpc::{Operation, RpcPolicies};

/// Which processes this binary runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Login, world and one channel in a single process
    Standalone,
    Login,
    World,
    Channel,
}

impl std::str::FromStr for ServerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "standalone" => Ok(ServerMode::Standalone),
            "login" => Ok(ServerMode::Login),
            "world" => Ok(ServerMode::World),
            "channel" => Ok(ServerMode::Channel),
            other => anyhow::bail!("Unknown server mode {:?}", other),
        }
    }
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path the configuration was loaded from
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default = "default_mode")]
    pub mode: ServerMode,

    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Address every listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Host advertised to clients and peers
    #[serde(default = "default_public_host")]
    pub public_host: String,

    #[serde(default = "default_login_port")]
    pub login_port: u16,

    /// Client port of channel 1; channel N listens on `channel_port + N - 1`
    #[serde(default = "default_channel_port")]
    pub channel_port: u16,

    #[serde(default = "default_world_rpc_port")]
    pub world_rpc_port: u16,

    /// RPC port of channel 1, offset like `channel_port`
    #[serde(default = "default_channel_rpc_port")]
    pub channel_rpc_port: u16,

    #[serde(default = "default_channel_id")]
    pub channel_id: u16,

    /// Largest client frame accepted
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,

    /// Accept any credentials, creating accounts on first login
    #[serde(default)]
    pub dev_mode: bool,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub group: GroupConfig,

    #[serde(default)]
    pub world: WorldConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_per_ip")]
    pub max_per_ip: usize,

    #[serde(default = "default_session_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Where the world process serves RPC
    #[serde(default = "default_world_address")]
    pub world_address: String,

    #[serde(default = "default_rpc_max_frame")]
    pub max_frame_length: usize,

    #[serde(default = "default_rpc_queue")]
    pub queue_capacity: usize,

    /// Per-operation timeout overrides, e.g. `TransferSession = 5000`
    #[serde(default)]
    pub timeouts_ms: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_max_members")]
    pub max_members: usize,

    #[serde(default = "default_max_groups_per_member")]
    pub max_groups_per_member: usize,

    /// Evict members silent for this long (0 to disable)
    #[serde(default = "default_group_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,

    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ticks: u64,
}

// Default value functions
fn default_mode() -> ServerMode {
    ServerMode::Standalone
}

fn default_server_name() -> String {
    "Realmgate".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_public_host() -> String {
    "127.0.0.1".to_string()
}

fn default_login_port() -> u16 {
    20001
}

fn default_channel_port() -> u16 {
    20002
}

fn default_world_rpc_port() -> u16 {
    21001
}

fn default_channel_rpc_port() -> u16 {
    21002
}

fn default_channel_id() -> u16 {
    1
}

fn default_max_frame_length() -> usize {
    MAX_PACKET_SIZE
}

fn default_max_per_ip() -> usize {
    10
}

fn default_session_idle_timeout() -> u64 {
    300
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_inbound_capacity() -> usize {
    64
}

fn default_world_address() -> String {
    "127.0.0.1:21001".to_string()
}

fn default_rpc_max_frame() -> usize {
    MAX_RPC_FRAME
}

fn default_rpc_queue() -> usize {
    256
}

fn default_max_members() -> usize {
    20
}

fn default_max_groups_per_member() -> usize {
    3
}

fn default_group_idle_timeout() -> u64 {
    1800
}

fn default_tick_rate() -> u64 {
    600
}

fn default_task_queue_capacity() -> usize {
    16
}

fn default_sweep_interval() -> u64 {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_per_ip: default_max_per_ip(),
            idle_timeout_secs: default_session_idle_timeout(),
            outbound_capacity: default_outbound_capacity(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            world_address: default_world_address(),
            max_frame_length: default_rpc_max_frame(),
            queue_capacity: default_rpc_queue(),
            timeouts_ms: HashMap::new(),
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_members: default_max_members(),
            max_groups_per_member: default_max_groups_per_member(),
            idle_timeout_secs: default_group_idle_timeout(),
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            tick_rate_ms: default_tick_rate(),
            task_queue_capacity: default_task_queue_capacity(),
            sweep_interval_ticks: default_sweep_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            mode: default_mode(),
            server_name: default_server_name(),
            bind_address: default_bind_address(),
            public_host: default_public_host(),
            login_port: default_login_port(),
            channel_port: default_channel_port(),
            world_rpc_port: default_world_rpc_port(),
            channel_rpc_port: default_channel_rpc_port(),
            channel_id: default_channel_id(),
            max_frame_length: default_max_frame_length(),
            dev_mode: false,
            log_json: false,
            session: SessionConfig::default(),
            rpc: RpcConfig::default(),
            group: GroupConfig::default(),
            world: WorldConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        let config_path = env::var("REALMGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REALMGATE_MODE") {
            match val.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => tracing::warn!(error = %e, "Ignoring REALMGATE_MODE"),
            }
        }
        if let Ok(val) = env::var("REALMGATE_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("REALMGATE_BIND_ADDRESS") {
            self.bind_address = val;
        }
        if let Ok(val) = env::var("REALMGATE_PUBLIC_HOST") {
            self.public_host = val;
        }
        if let Ok(val) = env::var("REALMGATE_LOGIN_PORT") {
            if let Ok(port) = val.parse() {
                self.login_port = port;
            }
        }
        if let Ok(val) = env::var("REALMGATE_CHANNEL_PORT") {
            if let Ok(port) = val.parse() {
                self.channel_port = port;
            }
        }
        if let Ok(val) = env::var("REALMGATE_CHANNEL_ID") {
            if let Ok(id) = val.parse() {
                self.channel_id = id;
            }
        }
        if let Ok(val) = env::var("REALMGATE_WORLD_ADDRESS") {
            self.rpc.world_address = val;
        }
        if let Ok(val) = env::var("REALMGATE_DEV_MODE") {
            self.dev_mode = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("REALMGATE_LOG_JSON") {
            self.log_json = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.channel_id == 0 {
            anyhow::bail!("Channel ID must be at least 1 (0 means the login server)");
        }

        let ports = [
            self.login_port,
            self.channel_port(),
            self.world_rpc_port,
            self.channel_rpc_port(),
        ];
        for (i, port) in ports.iter().enumerate() {
            if ports[i + 1..].contains(port) {
                anyhow::bail!("Port {} is assigned twice", port);
            }
        }

        if self.max_frame_length < 16 || self.max_frame_length > MAX_PACKET_SIZE {
            anyhow::bail!("Max frame length must be between 16 and {}", MAX_PACKET_SIZE);
        }
        if self.session.max_per_ip == 0 {
            anyhow::bail!("Session max_per_ip must be at least 1");
        }
        if self.session.outbound_capacity == 0 || self.session.inbound_capacity == 0 {
            anyhow::bail!("Session queue capacities must be at least 1");
        }
        if self.group.max_members < 2 {
            anyhow::bail!("Groups must allow at least 2 members");
        }
        if self.group.max_groups_per_member == 0 {
            anyhow::bail!("Members must be allowed at least 1 group");
        }
        if self.world.tick_rate_ms < 50 || self.world.tick_rate_ms > 5000 {
            anyhow::bail!("Tick rate must be between 50ms and 5000ms");
        }
        for (name, ms) in &self.rpc.timeouts_ms {
            if operation_named(name).is_none() {
                anyhow::bail!("Unknown RPC operation {:?} in rpc.timeouts_ms", name);
            }
            if *ms == 0 {
                anyhow::bail!("RPC timeout for {} must be positive", name);
            }
        }

        Ok(())
    }

    /// Client port of the configured channel
    pub fn channel_port(&self) -> u16 {
        self.channel_port + self.channel_id.saturating_sub(1)
    }

    /// RPC port of the configured channel
    pub fn channel_rpc_port(&self) -> u16 {
        self.channel_rpc_port + self.channel_id.saturating_sub(1)
    }

    pub fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.bind_address, port)
    }

    /// Public address clients use to reach `port`
    pub fn public_addr(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.public_host, port)
            .parse()
            .with_context(|| format!("Invalid public host {:?}", self.public_host))
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_per_ip: self.session.max_per_ip,
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            outbound_capacity: self.session.outbound_capacity,
        }
    }

    pub fn rpc_policies(&self) -> RpcPolicies {
        self.rpc
            .timeouts_ms
            .iter()
            .filter_map(|(name, ms)| operation_named(name).map(|op| (op, *ms)))
            .fold(RpcPolicies::default(), |policies, (op, ms)| {
                policies.with_timeout(op, Duration::from_millis(ms))
            })
    }

    pub fn group_limits(&self) -> GroupLimits {
        GroupLimits {
            max_members: self.group.max_members,
            max_groups_per_member: self.group.max_groups_per_member,
        }
    }

    pub fn group_idle_timeout(&self) -> Option<Duration> {
        (self.group.idle_timeout_secs > 0).then(|| Duration::from_secs(self.group.idle_timeout_secs))
    }

    pub fn world_settings(&self) -> WorldSettings {
        WorldSettings {
            name: self.server_name.clone(),
            channel: self.channel_id,
            tick_rate_ms: self.world.tick_rate_ms,
            sweep_interval: self.world.sweep_interval_ticks,
        }
    }
}

fn operation_named(name: &str) -> Option<Operation> {
    Operation::ALL.into_iter().find(|op| op.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.mode, ServerMode::Standalone);
        assert_eq!(config.server_name, "Realmgate");
        assert_eq!(config.login_port, 20001);
        assert_eq!(config.channel_port(), 20002);
        assert_eq!(config.world.tick_rate_ms, 600);
        assert_eq!(config.group_limits(), GroupLimits::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_channel_ports_offset() {
        let mut config = ServerConfig::default();
        config.channel_id = 3;
        assert_eq!(config.channel_port(), 20004);
        assert_eq!(config.channel_rpc_port(), 21004);
    }

    #[test]
    fn test_parse_toml() {
        let config = ServerConfig::from_toml_str(
            r#"
            mode = "channel"
            channel_id = 2

            [rpc]
            world_address = "10.0.0.1:21001"

            [rpc.timeouts_ms]
            TransferSession = 5000

            [group]
            idle_timeout_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, ServerMode::Channel);
        assert_eq!(config.channel_id, 2);
        assert_eq!(config.rpc.world_address, "10.0.0.1:21001");
        assert_eq!(config.group_idle_timeout(), None);
        assert_eq!(
            config.rpc_policies().get(Operation::TransferSession).timeout,
            Duration::from_millis(5000)
        );
        assert_eq!(
            config.rpc_policies().get(Operation::ClaimSession),
            Operation::ClaimSession.default_policy()
        );
        // Untouched sections keep their defaults
        assert_eq!(config.session.max_per_ip, 10);
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_ok());

        config.channel_id = 0;
        assert!(config.validate().is_err());
        config.channel_id = 1;

        config.world_rpc_port = config.login_port;
        assert!(config.validate().is_err());
        config.world_rpc_port = 21001;

        config.group.max_members = 1;
        assert!(config.validate().is_err());
        config.group.max_members = 20;

        config
            .rpc
            .timeouts_ms
            .insert("Teleport".to_string(), 1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("World".parse::<ServerMode>().unwrap(), ServerMode::World);
        assert!("lobby".parse::<ServerMode>().is_err());
    }
}
