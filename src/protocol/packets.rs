//! Outbound packet builders
//!
//! Every function returns a complete payload (opcode included) ready for
//! [`Session::send`](crate::net::session::Session::send).

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;

use crate::error::{LoginResponse, MigrationResponse};
use crate::game::persistence::Character;
use crate::group::{GroupErrorCode, GroupEvent, GroupId, MemberInfo, MemberKey};
use crate::net::buffer::PacketWriter;
use crate::protocol::opcodes::SendOp;

// ============ Login ============

pub fn login_success(account_id: i64) -> Bytes {
    let mut w = PacketWriter::new(SendOp::LoginResult.as_u16());
    w.write_u8(LoginResponse::Success.as_u8())
        .write_i64(account_id);
    w.freeze()
}

pub fn login_error(code: LoginResponse, message: &str) -> Bytes {
    let mut w = PacketWriter::new(SendOp::LoginResult.as_u16());
    w.write_u8(code.as_u8()).write_unicode_string(message);
    w.freeze()
}

pub fn server_list(name: &str, endpoints: &[SocketAddr]) -> Bytes {
    let mut w = PacketWriter::new(SendOp::ServerList.as_u16());
    w.write_unicode_string(name)
        .write_u16(endpoints.len() as u16);
    for endpoint in endpoints {
        write_endpoint(&mut w, endpoint);
    }
    w.freeze()
}

#[repr(u8)]
enum CharacterListCommand {
    List = 0,
    Added = 1,
    Error = 2,
}

pub fn character_list(characters: &[Character], max_characters: usize) -> Bytes {
    let mut w = PacketWriter::new(SendOp::CharacterList.as_u16());
    w.write_u8(CharacterListCommand::List as u8)
        .write_u8(max_characters as u8)
        .write_u8(characters.len() as u8);
    for character in characters {
        write_character(&mut w, character);
    }
    w.freeze()
}

pub fn character_added(character: &Character) -> Bytes {
    let mut w = PacketWriter::new(SendOp::CharacterList.as_u16());
    w.write_u8(CharacterListCommand::Added as u8);
    write_character(&mut w, character);
    w.freeze()
}

pub fn character_error(message: &str) -> Bytes {
    let mut w = PacketWriter::new(SendOp::CharacterList.as_u16());
    w.write_u8(CharacterListCommand::Error as u8)
        .write_unicode_string(message);
    w.freeze()
}

fn write_character(w: &mut PacketWriter, character: &Character) {
    w.write_i64(character.id)
        .write_unicode_string(&character.name)
        .write_u16(character.level);
}

// ============ Migration ============

/// Tell the client where to reconnect and which token to present
pub fn login_to_game(endpoint: SocketAddr, token: u64, channel: u16) -> Bytes {
    let mut w = PacketWriter::new(SendOp::LoginToGame.as_u16());
    w.write_u8(MigrationResponse::Ok.as_u8());
    write_endpoint(&mut w, &endpoint);
    w.write_u64(token).write_u16(channel);
    w.freeze()
}

pub fn login_to_game_error(code: MigrationResponse, message: &str) -> Bytes {
    let mut w = PacketWriter::new(SendOp::LoginToGame.as_u16());
    w.write_u8(code.as_u8()).write_unicode_string(message);
    w.freeze()
}

pub fn move_result(code: MigrationResponse) -> Bytes {
    let mut w = PacketWriter::new(SendOp::MoveResult.as_u16());
    w.write_u8(code.as_u8());
    w.freeze()
}

fn write_endpoint(w: &mut PacketWriter, endpoint: &SocketAddr) {
    match endpoint.ip() {
        IpAddr::V4(ip) => w.write_u8(4).write_bytes(&ip.octets()),
        IpAddr::V6(ip) => w.write_u8(6).write_bytes(&ip.octets()),
    };
    w.write_u16(endpoint.port());
}

// ============ Session ============

pub fn heartbeat(key: u32, server_tick: u64) -> Bytes {
    let mut w = PacketWriter::new(SendOp::RequestHeartbeat.as_u16());
    w.write_u32(key).write_u64(server_tick);
    w.freeze()
}

pub fn kick(reason: &str) -> Bytes {
    let mut w = PacketWriter::new(SendOp::Kick.as_u16());
    w.write_unicode_string(reason);
    w.freeze()
}

// ============ Group chat ============

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum GroupChatCommand {
    Create = 1,
    Join = 3,
    Leave = 4,
    AddMember = 6,
    RemoveMember = 7,
    Chat = 10,
    Error = 13,
}

fn group_chat(command: GroupChatCommand, group_id: GroupId) -> PacketWriter {
    let mut w = PacketWriter::new(SendOp::GroupChat.as_u16());
    w.write_u8(command as u8).write_i32(group_id as i32);
    w
}

pub fn group_chat_create(group_id: GroupId) -> Bytes {
    group_chat(GroupChatCommand::Create, group_id).freeze()
}

/// Sent to the joining member with the full roster
pub fn group_chat_join(group_id: GroupId, members: &[MemberInfo]) -> Bytes {
    let mut w = group_chat(GroupChatCommand::Join, group_id);
    w.write_u8(members.len() as u8);
    for member in members {
        w.write_unicode_string(&member.name).write_bool(member.online);
    }
    w.freeze()
}

pub fn group_chat_leave(group_id: GroupId) -> Bytes {
    group_chat(GroupChatCommand::Leave, group_id).freeze()
}

pub fn group_chat_add_member(group_id: GroupId, member: &MemberInfo) -> Bytes {
    let mut w = group_chat(GroupChatCommand::AddMember, group_id);
    w.write_unicode_string(&member.name)
        .write_bool(member.online)
        .write_u16(member.channel);
    w.freeze()
}

pub fn group_chat_remove_member(group_id: GroupId, name: &str) -> Bytes {
    let mut w = group_chat(GroupChatCommand::RemoveMember, group_id);
    w.write_unicode_string(name);
    w.freeze()
}

pub fn group_chat_message(group_id: GroupId, from: &str, message: &str) -> Bytes {
    let mut w = group_chat(GroupChatCommand::Chat, group_id);
    w.write_unicode_string(from).write_unicode_string(message);
    w.freeze()
}

pub fn group_chat_error(code: GroupErrorCode, member: &str, target: &str) -> Bytes {
    let mut w = PacketWriter::new(SendOp::GroupChat.as_u16());
    w.write_u8(GroupChatCommand::Error as u8)
        .write_u8(code.as_u8())
        .write_unicode_string(member)
        .write_unicode_string(target);
    w.freeze()
}

/// Render a group event for one receiver. The member an event is about sees
/// a different packet than the rest of the group. A joining member gets
/// nothing here; its roster comes with the join response.
pub fn group_event(receiver: MemberKey, event: &GroupEvent) -> Option<Bytes> {
    let packet = match event {
        GroupEvent::Created { group_id } => group_chat_create(*group_id),
        GroupEvent::MemberJoined { member, .. } if member.key == receiver => return None,
        GroupEvent::MemberJoined { group_id, member } => {
            group_chat_add_member(*group_id, member)
        }
        GroupEvent::MemberLeft {
            group_id, member, ..
        } if member.key == receiver => group_chat_leave(*group_id),
        GroupEvent::MemberLeft {
            group_id, member, ..
        } => group_chat_remove_member(*group_id, &member.name),
        GroupEvent::Chat {
            group_id,
            from,
            message,
        } => group_chat_message(*group_id, from, message),
        GroupEvent::Disbanded { group_id } => group_chat_leave(*group_id),
    };
    Some(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::RemovalReason;
    use crate::net::buffer::PacketReader;

    fn member(key: MemberKey, name: &str) -> MemberInfo {
        MemberInfo {
            key,
            name: name.into(),
            channel: 1,
            online: true,
        }
    }

    #[test]
    fn test_login_to_game_layout() {
        let packet = login_to_game("10.0.0.5:20002".parse().unwrap(), 0xDEAD_BEEF, 3);
        let mut r = PacketReader::new(packet);

        assert_eq!(r.read_u16().unwrap(), SendOp::LoginToGame.as_u16());
        assert_eq!(r.read_u8().unwrap(), MigrationResponse::Ok.as_u8());
        assert_eq!(r.read_u8().unwrap(), 4);
        assert_eq!(&r.read_bytes(4).unwrap()[..], &[10, 0, 0, 5]);
        assert_eq!(r.read_u16().unwrap(), 20002);
        assert_eq!(r.read_u64().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u16().unwrap(), 3);
        assert!(!r.has_remaining());
    }

    #[test]
    fn test_group_event_per_receiver() {
        let leaver = member(2, "Bob");
        let event = GroupEvent::MemberLeft {
            group_id: 9,
            member: leaver,
            reason: RemovalReason::IdleTimeout,
        };

        let mut own = PacketReader::new(group_event(2, &event).unwrap());
        own.skip(2).unwrap();
        assert_eq!(own.read_u8().unwrap(), GroupChatCommand::Leave as u8);
        assert_eq!(own.read_i32().unwrap(), 9);

        let mut other = PacketReader::new(group_event(1, &event).unwrap());
        other.skip(2).unwrap();
        assert_eq!(other.read_u8().unwrap(), GroupChatCommand::RemoveMember as u8);
        assert_eq!(other.read_i32().unwrap(), 9);
        assert_eq!(other.read_unicode_string().unwrap(), "Bob");

        let joined = GroupEvent::MemberJoined {
            group_id: 9,
            member: member(3, "Cat"),
        };
        assert!(group_event(3, &joined).is_none());
        assert!(group_event(1, &joined).is_some());
    }

    #[test]
    fn test_group_chat_message() {
        let mut r = PacketReader::new(group_chat_message(4, "Alice", "hi all"));
        assert_eq!(r.read_u16().unwrap(), SendOp::GroupChat.as_u16());
        assert_eq!(r.read_u8().unwrap(), 10);
        assert_eq!(r.read_i32().unwrap(), 4);
        assert_eq!(r.read_unicode_string().unwrap(), "Alice");
        assert_eq!(r.read_unicode_string().unwrap(), "hi all");
    }
}
