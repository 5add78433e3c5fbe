//! Group membership
//!
//! Transient groups (group chats) hosted by the world process:
//! - `registry`: the concurrent group -> members map with per-member idle timers
//! - events emitted to members through an injected [`GroupNotifier`]

pub mod registry;

use serde::{Deserialize, Serialize};

use crate::error::{GroupLimit, RegistryError};

pub use registry::{EvictionHandle, GroupRegistry};

/// Group identifier
pub type GroupId = u64;

/// Member key (character id), unique within a group
pub type MemberKey = i64;

/// Display attributes of a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub key: MemberKey,
    pub name: String,
    /// Channel hosting the member's session
    pub channel: u16,
    pub online: bool,
}

/// Why a member left a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    Left,
    IdleTimeout,
    Disconnected,
}

/// Notification fanned out to group members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupEvent {
    Created {
        group_id: GroupId,
    },
    MemberJoined {
        group_id: GroupId,
        member: MemberInfo,
    },
    MemberLeft {
        group_id: GroupId,
        member: MemberInfo,
        reason: RemovalReason,
    },
    Chat {
        group_id: GroupId,
        from: String,
        message: String,
    },
    Disbanded {
        group_id: GroupId,
    },
}

impl GroupEvent {
    pub fn group_id(&self) -> GroupId {
        match self {
            GroupEvent::Created { group_id }
            | GroupEvent::MemberJoined { group_id, .. }
            | GroupEvent::MemberLeft { group_id, .. }
            | GroupEvent::Chat { group_id, .. }
            | GroupEvent::Disbanded { group_id } => *group_id,
        }
    }
}

/// Delivers group events to members. Called with the group's lock held, so
/// implementations must not block or call back into the registry.
pub trait GroupNotifier: Send + Sync + 'static {
    fn notify(&self, receivers: &[MemberInfo], event: &GroupEvent);
}

/// Notifier that drops everything
pub struct NullNotifier;

impl GroupNotifier for NullNotifier {
    fn notify(&self, _receivers: &[MemberInfo], _event: &GroupEvent) {}
}

/// Capacity limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLimits {
    pub max_members: usize,
    pub max_groups_per_member: usize,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self {
            max_members: 20,
            max_groups_per_member: 3,
        }
    }
}

/// Client-facing error codes for group chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GroupErrorCode {
    NotFound = 1,
    AlreadyMember = 2,
    GroupFull = 3,
    TooManyGroups = 4,
    NotMember = 5,
    Unavailable = 6,
}

impl GroupErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<&RegistryError> for GroupErrorCode {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::Conflict { .. } => GroupErrorCode::AlreadyMember,
            RegistryError::NotFound(_) => GroupErrorCode::NotFound,
            RegistryError::MemberNotFound { .. } => GroupErrorCode::NotMember,
            RegistryError::ResourceExhausted(GroupLimit::GroupFull { .. }) => {
                GroupErrorCode::GroupFull
            }
            RegistryError::ResourceExhausted(GroupLimit::TooManyGroups { .. }) => {
                GroupErrorCode::TooManyGroups
            }
            RegistryError::EntityExists(_) | RegistryError::EntityNotFound(_) => {
                GroupErrorCode::Unavailable
            }
        }
    }
}
