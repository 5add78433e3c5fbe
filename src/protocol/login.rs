//! Login tier handlers
//!
//! The login process authenticates a connection, lists and creates
//! characters, and on character selection hands the client off to a game
//! channel:
//! 1. `ResponseVersion`: client version and machine id
//! 2. `ResponseLogin`: credentials, answered with the server or character list
//! 3. `CharacterManagement`: create a character, or select one and receive
//!    the channel endpoint plus a one-time migration token

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthService, MAX_CHARACTERS};
use crate::error::{
    AuthError, LoginResponse, MigrationResponse, ProtocolError, RealmgateError, Result,
};
use crate::net::buffer::PacketReader;
use crate::net::dispatch::{DispatchTable, PacketHandler};
use crate::net::session::{Session, SessionManager, SessionState};
use crate::protocol::opcodes::RecvOp;
use crate::protocol::packets;
use crate::rpc::{DisconnectRequest, RpcGateway, TransferSessionRequest, TransferTarget};

/// Client build accepted by this server
pub const CLIENT_VERSION: u32 = 12;

/// Everything the login handlers share
pub struct LoginContext {
    pub server_name: String,
    pub auth: Arc<AuthService>,
    pub sessions: Arc<SessionManager>,
    pub world: RpcGateway,
    /// Channel endpoints shown in the server list
    pub endpoints: Vec<SocketAddr>,
}

/// Dispatch table for the login process
pub fn login_table(context: Arc<LoginContext>) -> Result<DispatchTable> {
    Ok(DispatchTable::builder()
        .register(VersionHandler)?
        .register(LoginHandler {
            context: context.clone(),
        })?
        .register(CharacterManagementHandler { context })?
        .build())
}

/// Version check, first packet on every tier
pub struct VersionHandler;

#[async_trait]
impl PacketHandler for VersionHandler {
    fn opcode(&self) -> u16 {
        RecvOp::ResponseVersion.as_u16()
    }

    fn name(&self) -> &'static str {
        "ResponseVersion"
    }

    fn allowed_states(&self) -> &'static [SessionState] {
        &[SessionState::Connecting]
    }

    async fn handle(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let version = packet.read_u32()?;
        let raw = packet.read_bytes(16)?;
        let machine_id = Uuid::from_slice(&raw)
            .map_err(|_| ProtocolError::MalformedPacket("machine id".into()))?;

        if version != CLIENT_VERSION {
            warn!(
                session_id = session.id,
                version = version,
                expected = CLIENT_VERSION,
                "Unsupported client version"
            );
            let _ = session.send(packets::kick("Unsupported client version"));
            session.disconnect();
            return Ok(());
        }

        session.set_machine_id(machine_id);
        session.transition(SessionState::Authenticating)?;
        debug!(session_id = session.id, machine_id = %machine_id, "Version accepted");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LoginCommand {
    ServerList = 1,
    CharacterList = 2,
}

impl LoginCommand {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ServerList),
            2 => Some(Self::CharacterList),
            _ => None,
        }
    }
}

pub struct LoginHandler {
    context: Arc<LoginContext>,
}

#[async_trait]
impl PacketHandler for LoginHandler {
    fn opcode(&self) -> u16 {
        RecvOp::ResponseLogin.as_u16()
    }

    fn name(&self) -> &'static str {
        "ResponseLogin"
    }

    fn allowed_states(&self) -> &'static [SessionState] {
        &[SessionState::Authenticating]
    }

    async fn handle(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let raw_command = packet.read_u8()?;
        let command = LoginCommand::from_u8(raw_command).ok_or(ProtocolError::UnknownCommand {
            opcode: self.opcode(),
            command: raw_command,
        })?;
        let username = packet.read_unicode_string()?;
        let password = packet.read_unicode_string()?;

        let ctx = &self.context;
        let account = match ctx.auth.authenticate(&username, &password).await {
            Ok(account) => account,
            Err(RealmgateError::Auth(err)) => {
                let _ = session.send(packets::login_error(
                    LoginResponse::from(&err),
                    &err.to_string(),
                ));
                return Err(err.into());
            }
            Err(err) => {
                let _ = session.send(packets::login_error(
                    LoginResponse::CouldNotCompleteLogin,
                    "Login failed",
                ));
                return Err(err);
            }
        };

        if let Err(err) = ctx.sessions.bind_account(session, account.id) {
            let _ = session.send(packets::login_error(
                LoginResponse::AlreadyLoggedIn,
                "Account already logged in",
            ));
            return Err(err);
        }
        // Anything still holding the account on a channel goes away
        ctx.world.notify(DisconnectRequest {
            account_id: account.id,
            reason: "Logged in from another location".into(),
        })?;

        session.set_username(account.username.clone());
        session.transition(SessionState::Authenticated)?;
        info!(
            session_id = session.id,
            account_id = account.id,
            username = %account.username,
            "Login accepted"
        );

        session.send(packets::login_success(account.id))?;
        match command {
            LoginCommand::ServerList => {
                session.send(packets::server_list(&ctx.server_name, &ctx.endpoints))?;
            }
            LoginCommand::CharacterList => {
                let characters = ctx.auth.characters(account.id).await?;
                session.send(packets::character_list(&characters, MAX_CHARACTERS))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum CharacterCommand {
    Select = 0,
    Create = 1,
}

impl CharacterCommand {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Select),
            1 => Some(Self::Create),
            _ => None,
        }
    }
}

pub struct CharacterManagementHandler {
    context: Arc<LoginContext>,
}

impl CharacterManagementHandler {
    async fn select(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let character_id = packet.read_i64()?;
        let account_id = session
            .account_id()
            .ok_or(RealmgateError::Auth(AuthError::InvalidCredentials))?;

        let character = match self.context.auth.owned_character(account_id, character_id).await {
            Ok(character) => character,
            Err(err) => {
                let _ = session.send(packets::character_error("Character not found"));
                return Err(err);
            }
        };

        let request = TransferSessionRequest {
            account_id,
            character_id: character.id,
            machine_id: session.machine_id(),
            target: TransferTarget::Channel(None),
        };
        match self.context.world.call_scoped(session.scope(), request).await {
            Ok(grant) => {
                info!(
                    session_id = session.id,
                    account_id = account_id,
                    character_id = character.id,
                    channel = grant.channel,
                    address = %grant.address,
                    "Migrating to game channel"
                );
                session.send(packets::login_to_game(grant.address, grant.token, grant.channel))?;
                session.disconnect();
                Ok(())
            }
            Err(err) => {
                let _ = session.send(packets::login_to_game_error(
                    MigrationResponse::from(&err),
                    "Unable to enter game",
                ));
                Err(err.into())
            }
        }
    }

    async fn create(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let name = packet.read_unicode_string()?;
        let account_id = session
            .account_id()
            .ok_or(RealmgateError::Auth(AuthError::InvalidCredentials))?;

        match self.context.auth.create_character(account_id, &name).await {
            Ok(character) => {
                debug!(
                    session_id = session.id,
                    character_id = character.id,
                    name = %character.name,
                    "Character created"
                );
                session.send(packets::character_added(&character))
            }
            Err(err) => {
                let _ = session.send(packets::character_error(&err.to_string()));
                Err(err)
            }
        }
    }
}

#[async_trait]
impl PacketHandler for CharacterManagementHandler {
    fn opcode(&self) -> u16 {
        RecvOp::CharacterManagement.as_u16()
    }

    fn name(&self) -> &'static str {
        "CharacterManagement"
    }

    fn allowed_states(&self) -> &'static [SessionState] {
        &[SessionState::Authenticated]
    }

    async fn handle(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let raw_command = packet.read_u8()?;
        match CharacterCommand::from_u8(raw_command) {
            Some(CharacterCommand::Select) => self.select(session, packet).await,
            Some(CharacterCommand::Create) => self.create(session, packet).await,
            None => Err(ProtocolError::UnknownCommand {
                opcode: self.opcode(),
                command: raw_command,
            }
            .into()),
        }
    }
}
