//! Entity table
//!
//! Every AI-driven or player-owned entity in the process, each with its own
//! task scheduler behind a per-entity mutex. The world loop ticks the table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::ai::task::{ProposalOutcome, TaskPriority, TaskScheduler, Tick};
use crate::error::{RegistryError, Result, TaskError};
use crate::net::session::{Session, SessionId};

pub type EntityId = u64;

/// What an entity is doing. Opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Wander,
    Follow { target: EntityId },
    Attack { target: EntityId },
    PickUp { item: u64 },
    Stunned,
    Talk { target: EntityId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Npc { template_id: u32 },
    Player { session_id: SessionId, character_id: i64 },
}

pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub scheduler: TaskScheduler<Behavior>,
}

/// Snapshot of an entity's scheduling state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatus {
    pub id: EntityId,
    pub kind: EntityKind,
    pub current: Option<(TaskPriority, Behavior)>,
    pub queued: usize,
}

pub struct EntityTable {
    entities: DashMap<EntityId, Arc<Mutex<Entity>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl EntityTable {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            entities: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
        })
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    fn insert(&self, kind: EntityKind) -> EntityId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entity = Entity {
            id,
            kind,
            scheduler: TaskScheduler::new(self.queue_capacity),
        };
        self.entities.insert(id, Arc::new(Mutex::new(entity)));
        id
    }

    /// Spawn a server-driven entity
    pub fn spawn_npc(&self, template_id: u32) -> EntityId {
        let id = self.insert(EntityKind::Npc { template_id });
        debug!(entity_id = id, template_id = template_id, "NPC spawned");
        id
    }

    /// Create the entity for a player session. The entity is removed when the
    /// session closes.
    pub fn bind_player(self: &Arc<Self>, session: &Arc<Session>, character_id: i64) -> EntityId {
        let id = self.insert(EntityKind::Player {
            session_id: session.id,
            character_id,
        });
        session.set_entity_id(id);

        let table: Weak<EntityTable> = Arc::downgrade(self);
        session.on_close(move || {
            if let Some(table) = table.upgrade() {
                table.remove(id);
            }
        });

        debug!(
            entity_id = id,
            session_id = session.id,
            character_id = character_id,
            "Player entity bound"
        );
        id
    }

    pub fn remove(&self, id: EntityId) -> bool {
        let removed = self.entities.remove(&id).is_some();
        if removed {
            debug!(entity_id = id, "Entity removed");
        }
        removed
    }

    fn entity(&self, id: EntityId) -> Result<Arc<Mutex<Entity>>> {
        self.entities
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| RegistryError::EntityNotFound(id).into())
    }

    /// Offer a behavior to an entity's scheduler
    pub fn propose(
        &self,
        id: EntityId,
        priority: TaskPriority,
        behavior: Behavior,
        now: Tick,
        lifetime: Option<Tick>,
    ) -> Result<ProposalOutcome<Behavior>> {
        let entity = self.entity(id)?;
        let mut entity = entity.lock();
        let outcome = entity
            .scheduler
            .propose(priority, behavior, now, lifetime)
            .map_err(|e: TaskError| {
                debug!(entity_id = id, error = %e, "Proposal rejected");
                e
            })?;

        if let ProposalOutcome::Started { displaced } = &outcome {
            trace!(
                entity_id = id,
                priority = ?priority,
                displaced = ?displaced.as_ref().map(|t| t.priority),
                "Task started"
            );
        }
        Ok(outcome)
    }

    /// Mark an entity's current task finished
    pub fn complete(&self, id: EntityId, now: Tick) -> Result<Option<Behavior>> {
        let entity = self.entity(id)?;
        let mut entity = entity.lock();
        Ok(entity.scheduler.complete(now).map(|t| t.payload))
    }

    pub fn status(&self, id: EntityId) -> Result<EntityStatus> {
        let entity = self.entity(id)?;
        let entity = entity.lock();
        Ok(EntityStatus {
            id: entity.id,
            kind: entity.kind,
            current: entity
                .scheduler
                .current()
                .map(|t| (t.priority, t.payload.clone())),
            queued: entity.scheduler.queued(),
        })
    }

    /// Advance every scheduler to `now`. Returns how many entities are busy.
    pub fn tick_all(&self, now: Tick) -> usize {
        // Snapshot first so no shard lock is held while an entity is locked
        let entities: Vec<Arc<Mutex<Entity>>> =
            self.entities.iter().map(|e| e.value().clone()).collect();

        entities
            .iter()
            .filter(|entity| entity.lock().scheduler.tick(now).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::session::{ProcessTier, SessionManager};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_propose_and_status() {
        let table = EntityTable::new(4);
        let id = table.spawn_npc(100);

        table
            .propose(id, TaskPriority::BattleMovement, Behavior::Wander, 0, None)
            .unwrap();
        table
            .propose(id, TaskPriority::Stun, Behavior::Stunned, 1, Some(3))
            .unwrap();

        let status = table.status(id).unwrap();
        assert_eq!(
            status.current,
            Some((TaskPriority::Stun, Behavior::Stunned))
        );
        assert_eq!(status.queued, 0);

        // Stun wears off; nothing queued behind it
        assert_eq!(table.tick_all(4), 0);
    }

    #[test]
    fn test_unknown_entity() {
        let table = EntityTable::new(4);
        let err = table
            .propose(9, TaskPriority::Idle, Behavior::Wander, 0, None)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::RealmgateError::Registry(RegistryError::EntityNotFound(9))
        ));
    }

    #[test]
    fn test_tick_all_promotes_queued() {
        let table = EntityTable::new(4);
        let a = table.spawn_npc(1);
        let b = table.spawn_npc(2);

        table
            .propose(a, TaskPriority::Stun, Behavior::Stunned, 0, Some(2))
            .unwrap();
        table
            .propose(a, TaskPriority::BattleAction, Behavior::Attack { target: b }, 0, None)
            .unwrap();

        assert_eq!(table.tick_all(1), 1);
        assert_eq!(table.tick_all(2), 1);
        assert_eq!(
            table.status(a).unwrap().current,
            Some((TaskPriority::BattleAction, Behavior::Attack { target: b }))
        );
    }

    #[tokio::test]
    async fn test_player_entity_removed_on_close() {
        let sessions = Arc::new(SessionManager::new(ProcessTier::Channel));
        let (session, _rx) = sessions
            .create_session("127.0.0.1:5000".parse().unwrap())
            .unwrap();

        let table = EntityTable::new(4);
        let id = table.bind_player(&session, 42);
        assert!(table.contains(id));
        assert_eq!(session.entity_id(), Some(id));

        session.close();
        assert!(!table.contains(id));

        // Binding after teardown removes the entity straight away
        let late = table.bind_player(&session, 43);
        assert!(!table.contains(late));
    }
}
