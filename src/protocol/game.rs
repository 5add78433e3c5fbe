//! Game tier handlers
//!
//! Handles the packets a channel process accepts:
//! - `ResponseKey`: redeem the migration token issued at login and enter play
//! - `ResponseHeartbeat`: keep-alive, answered with the current tick
//! - `GroupChat`: group chat commands, forwarded to the world process
//!
//! Group events for members on this channel come back through the channel's
//! RPC service, not through these handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::ai::EntityTable;
use crate::error::{MigrationResponse, ProtocolError, RealmgateError, Result, StateError};
use crate::game::persistence::{Character, SaveBatch, Storage};
use crate::game::world::GameWorld;
use crate::group::{GroupErrorCode, MemberInfo};
use crate::net::buffer::PacketReader;
use crate::net::dispatch::{DispatchTable, PacketHandler};
use crate::net::session::{Session, SessionManager, SessionState};
use crate::protocol::login::VersionHandler;
use crate::protocol::opcodes::RecvOp;
use crate::protocol::packets;
use crate::rpc::{
    ClaimSessionRequest, GroupChatCommand, GroupChatRequest, LeaveGroupsRequest, RpcGateway,
};

/// Everything the game handlers share
pub struct GameContext {
    pub channel: u16,
    pub sessions: Arc<SessionManager>,
    pub entities: Arc<EntityTable>,
    pub storage: Arc<dyn Storage>,
    pub world: RpcGateway,
    pub game_world: Arc<GameWorld>,
}

/// Dispatch table for a channel process
pub fn game_table(context: Arc<GameContext>) -> Result<DispatchTable> {
    Ok(DispatchTable::builder()
        .register(VersionHandler)?
        .register(ResponseKeyHandler {
            context: context.clone(),
        })?
        .register(HeartbeatHandler {
            context: context.clone(),
        })?
        .register(GroupChatHandler { context })?
        .build())
}

pub struct ResponseKeyHandler {
    context: Arc<GameContext>,
}

impl ResponseKeyHandler {
    fn refuse(session: &Session, code: MigrationResponse) {
        let _ = session.send(packets::move_result(code));
        session.disconnect();
    }
}

#[async_trait]
impl PacketHandler for ResponseKeyHandler {
    fn opcode(&self) -> u16 {
        RecvOp::ResponseKey.as_u16()
    }

    fn name(&self) -> &'static str {
        "ResponseKey"
    }

    fn allowed_states(&self) -> &'static [SessionState] {
        &[SessionState::Authenticating]
    }

    async fn handle(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let account_id = packet.read_i64()?;
        let token = packet.read_u64()?;
        let ctx = &self.context;

        let claim = ClaimSessionRequest {
            account_id,
            token,
            machine_id: session.machine_id(),
        };
        let claimed = match ctx.world.call_scoped(session.scope(), claim).await {
            Ok(claimed) => claimed,
            Err(err) => {
                Self::refuse(session, MigrationResponse::from(&err));
                return Err(err.into());
            }
        };
        if claimed.channel != ctx.channel {
            Self::refuse(session, MigrationResponse::InvalidChannel);
            return Err(RealmgateError::Internal(format!(
                "Token for channel {} redeemed on channel {}",
                claimed.channel, ctx.channel
            )));
        }

        let character = match ctx.storage.find_character(claimed.character_id).await {
            Ok(Some(character)) => character,
            Ok(None) => {
                Self::refuse(session, MigrationResponse::Failed);
                return Err(RealmgateError::Internal(format!(
                    "Character {} vanished during migration",
                    claimed.character_id
                )));
            }
            Err(err) => {
                Self::refuse(session, MigrationResponse::Failed);
                return Err(err);
            }
        };

        // Remember where the character last played
        if character.channel != ctx.channel {
            let stamped = Character {
                channel: ctx.channel,
                ..character.clone()
            };
            let batch = SaveBatch {
                characters: vec![stamped],
                ..SaveBatch::default()
            };
            if let Err(err) = ctx.storage.save(batch).await {
                Self::refuse(session, MigrationResponse::Failed);
                return Err(err);
            }
        }

        // Both binds fail if the client hung up during the awaits above
        let bound = ctx
            .sessions
            .bind_account(session, account_id)
            .and_then(|()| ctx.sessions.bind_character(session, character.id));
        if let Err(err) = bound {
            Self::refuse(session, MigrationResponse::Failed);
            return Err(err);
        }
        session.set_username(character.name.clone());
        let entity_id = ctx.entities.bind_player(session, character.id);

        // Leaving the channel takes the character out of every group
        let world = ctx.world.clone();
        let member = MemberInfo {
            key: character.id,
            name: character.name.clone(),
            channel: ctx.channel,
            online: false,
        };
        let session_id = session.id;
        session.on_close(move || {
            if let Err(e) = world.notify(LeaveGroupsRequest { member }) {
                warn!(session_id = session_id, error = %e, "Group cleanup not sent");
            }
        });

        session.transition(SessionState::Authenticated)?;
        session.transition(SessionState::Active)?;
        session.send(packets::move_result(MigrationResponse::Ok))?;

        info!(
            session_id = session.id,
            account_id = account_id,
            character_id = character.id,
            entity_id = entity_id,
            channel = ctx.channel,
            "Entered game"
        );
        Ok(())
    }
}

pub struct HeartbeatHandler {
    context: Arc<GameContext>,
}

#[async_trait]
impl PacketHandler for HeartbeatHandler {
    fn opcode(&self) -> u16 {
        RecvOp::ResponseHeartbeat.as_u16()
    }

    fn name(&self) -> &'static str {
        "ResponseHeartbeat"
    }

    fn allowed_states(&self) -> &'static [SessionState] {
        &[SessionState::Authenticated, SessionState::Active]
    }

    async fn handle(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let key = packet.read_u32()?;
        session.send(packets::heartbeat(key, self.context.game_world.tick()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum GroupChatOp {
    Create = 1,
    Join = 2,
    Leave = 4,
    Chat = 10,
}

impl GroupChatOp {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Create),
            2 => Some(Self::Join),
            4 => Some(Self::Leave),
            10 => Some(Self::Chat),
            _ => None,
        }
    }
}

pub struct GroupChatHandler {
    context: Arc<GameContext>,
}

impl GroupChatHandler {
    fn requester(&self, session: &Session) -> Result<MemberInfo> {
        let key = session.character_id().ok_or(StateError::UnsupportedState {
            opcode: self.opcode(),
            state: session.state(),
        })?;
        Ok(MemberInfo {
            key,
            name: session.username().unwrap_or_default(),
            channel: self.context.channel,
            online: true,
        })
    }

    fn read_command(&self, packet: &mut PacketReader) -> Result<GroupChatCommand> {
        let raw = packet.read_u8()?;
        let op = GroupChatOp::from_u8(raw).ok_or(ProtocolError::UnknownCommand {
            opcode: self.opcode(),
            command: raw,
        })?;

        let command = match op {
            GroupChatOp::Create => GroupChatCommand::Create,
            GroupChatOp::Join => GroupChatCommand::Join {
                group_id: read_group_id(packet)?,
            },
            GroupChatOp::Leave => GroupChatCommand::Leave {
                group_id: read_group_id(packet)?,
            },
            GroupChatOp::Chat => {
                let message = packet.read_unicode_string()?;
                GroupChatCommand::Chat {
                    message,
                    group_id: read_group_id(packet)?,
                }
            }
        };
        Ok(command)
    }
}

fn read_group_id(packet: &mut PacketReader) -> Result<u64> {
    let raw = packet.read_i32()?;
    u64::try_from(raw)
        .map_err(|_| ProtocolError::MalformedPacket(format!("group id {}", raw)).into())
}

#[async_trait]
impl PacketHandler for GroupChatHandler {
    fn opcode(&self) -> u16 {
        RecvOp::GroupChat.as_u16()
    }

    fn name(&self) -> &'static str {
        "GroupChat"
    }

    async fn handle(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()> {
        let command = self.read_command(packet)?;
        let requester = self.requester(session)?;
        let name = requester.name.clone();
        let target = match &command {
            GroupChatCommand::Join { group_id }
            | GroupChatCommand::Leave { group_id }
            | GroupChatCommand::Chat { group_id, .. } => group_id.to_string(),
            _ => String::new(),
        };

        let request = GroupChatRequest { requester, command };
        let response = match self.context.world.call_scoped(session.scope(), request).await {
            Ok(response) => response,
            Err(err) => {
                let _ = session.send(packets::group_chat_error(
                    GroupErrorCode::Unavailable,
                    &name,
                    &target,
                ));
                return Err(err.into());
            }
        };

        if let Some(code) = response.error {
            debug!(session_id = session.id, code = ?code, "Group chat refused");
            return session.send(packets::group_chat_error(code, &name, &target));
        }
        // Everything except the joiner's roster arrives as relayed group events
        if let Some(group_id) = response.group_id {
            if !response.members.is_empty() {
                session.send(packets::group_chat_join(group_id, &response.members))?;
            }
        }
        Ok(())
    }
}
