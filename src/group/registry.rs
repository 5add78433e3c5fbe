//! Group registry
//!
//! Concurrent map of groups to members. Each group has its own lock; there is
//! no registry-wide lock. Lock order is always group lock, then a map shard.
//!
//! Idle eviction: each member may carry one timer. Removing a member cancels
//! its timer inside the group's critical section, and a firing timer
//! re-checks its own identity under the same lock, so a member is removed at
//! most once no matter how leave and expiry race.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GroupLimit, RegistryError};
use crate::group::{
    GroupEvent, GroupId, GroupLimits, GroupNotifier, MemberInfo, MemberKey, RemovalReason,
};

type RegistryResult<T> = std::result::Result<T, RegistryError>;

struct IdleTimer {
    id: u64,
    token: CancellationToken,
}

struct Member {
    info: MemberInfo,
    timer: Option<IdleTimer>,
}

impl Member {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.token.cancel();
        }
    }
}

#[derive(Default)]
struct GroupState {
    members: HashMap<MemberKey, Member>,
    closed: bool,
}

impl GroupState {
    fn receivers(&self) -> Vec<MemberInfo> {
        self.members.values().map(|m| m.info.clone()).collect()
    }
}

struct Group {
    id: GroupId,
    state: Mutex<GroupState>,
}

/// Handle to a scheduled idle eviction
#[derive(Debug, Clone)]
pub struct EvictionHandle {
    pub group_id: GroupId,
    pub key: MemberKey,
    timer_id: u64,
    token: CancellationToken,
}

impl EvictionHandle {
    /// Cancel the eviction. Safe to call any number of times, and safe to race
    /// with the timer firing.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Registry of live groups
pub struct GroupRegistry {
    groups: DashMap<GroupId, Arc<Group>>,
    /// Reverse index: member key -> groups it belongs to
    memberships: DashMap<MemberKey, HashSet<GroupId>>,
    next_group_id: AtomicU64,
    next_timer_id: AtomicU64,
    limits: GroupLimits,
    /// Idle timeout re-armed by `touch`; `None` disables idle eviction
    idle_timeout: Option<Duration>,
    notifier: Arc<dyn GroupNotifier>,
}

impl GroupRegistry {
    pub fn new(
        limits: GroupLimits,
        idle_timeout: Option<Duration>,
        notifier: Arc<dyn GroupNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            groups: DashMap::new(),
            memberships: DashMap::new(),
            next_group_id: AtomicU64::new(1),
            next_timer_id: AtomicU64::new(1),
            limits,
            idle_timeout,
            notifier,
        })
    }

    pub fn limits(&self) -> GroupLimits {
        self.limits
    }

    /// Number of live groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, group_id: GroupId) -> bool {
        self.groups.contains_key(&group_id)
    }

    /// Reserve a group slot in the member's reverse index
    fn claim_membership(&self, group_id: GroupId, key: MemberKey) -> RegistryResult<()> {
        let mut groups = self.memberships.entry(key).or_default();
        if groups.len() >= self.limits.max_groups_per_member {
            return Err(RegistryError::ResourceExhausted(GroupLimit::TooManyGroups {
                key,
                max: self.limits.max_groups_per_member,
            }));
        }
        groups.insert(group_id);
        Ok(())
    }

    fn release_membership(&self, group_id: GroupId, key: MemberKey) {
        if let Some(mut groups) = self.memberships.get_mut(&key) {
            groups.remove(&group_id);
        }
        self.memberships.remove_if(&key, |_, groups| groups.is_empty());
    }

    /// Mark a group closed and drop it from the map. Must hold the group lock.
    fn destroy_locked(&self, group: &Arc<Group>, state: &mut GroupState) {
        state.closed = true;
        self.groups
            .remove_if(&group.id, |_, current| Arc::ptr_eq(current, group));
        debug!(group_id = group.id, "Group destroyed");
    }

    /// Create a group with `creator` as its only member
    pub fn create(&self, creator: MemberInfo) -> RegistryResult<GroupId> {
        let group_id = self.next_group_id.fetch_add(1, Ordering::SeqCst);
        let group = Arc::new(Group {
            id: group_id,
            state: Mutex::new(GroupState::default()),
        });

        let mut state = group.state.lock();
        self.claim_membership(group_id, creator.key)?;
        state.members.insert(
            creator.key,
            Member {
                info: creator.clone(),
                timer: None,
            },
        );
        self.groups.insert(group_id, group.clone());

        self.notifier
            .notify(&[creator.clone()], &GroupEvent::Created { group_id });
        info!(group_id = group_id, creator = creator.key, "Group created");
        Ok(group_id)
    }

    /// Add a member to an existing group. Returns the member list after the join.
    pub fn join(&self, group_id: GroupId, info: MemberInfo) -> RegistryResult<Vec<MemberInfo>> {
        let group = self
            .groups
            .get(&group_id)
            .map(|g| g.clone())
            .ok_or(RegistryError::NotFound(group_id))?;

        let mut state = group.state.lock();
        self.join_locked(&group, &mut state, info)
    }

    fn join_locked(
        &self,
        group: &Arc<Group>,
        state: &mut GroupState,
        info: MemberInfo,
    ) -> RegistryResult<Vec<MemberInfo>> {
        let group_id = group.id;
        if state.closed {
            return Err(RegistryError::NotFound(group_id));
        }
        if state.members.contains_key(&info.key) {
            return Err(RegistryError::Conflict {
                group_id,
                key: info.key,
            });
        }
        if state.members.len() >= self.limits.max_members {
            return Err(RegistryError::ResourceExhausted(GroupLimit::GroupFull {
                group_id,
                max: self.limits.max_members,
            }));
        }
        self.claim_membership(group_id, info.key)?;

        let key = info.key;
        state.members.insert(
            key,
            Member {
                info: info.clone(),
                timer: None,
            },
        );
        let receivers = state.receivers();
        self.notifier.notify(
            &receivers,
            &GroupEvent::MemberJoined {
                group_id,
                member: info,
            },
        );
        debug!(group_id = group_id, key = key, members = receivers.len(), "Member joined");
        Ok(receivers)
    }

    /// Join `group_id`, creating it first if it does not exist
    pub fn join_or_create(
        &self,
        group_id: GroupId,
        info: MemberInfo,
    ) -> RegistryResult<Vec<MemberInfo>> {
        loop {
            let group = self
                .groups
                .entry(group_id)
                .or_insert_with(|| {
                    Arc::new(Group {
                        id: group_id,
                        state: Mutex::new(GroupState::default()),
                    })
                })
                .clone();

            let mut state = group.state.lock();
            if state.closed {
                // Lost a race with destruction; the map no longer holds it
                continue;
            }
            let result = self.join_locked(&group, &mut state, info.clone());
            if state.members.is_empty() {
                self.destroy_locked(&group, &mut state);
            }
            return result;
        }
    }

    /// Remove a member. Destroys the group when it becomes empty.
    pub fn leave(
        &self,
        group_id: GroupId,
        key: MemberKey,
        reason: RemovalReason,
    ) -> RegistryResult<MemberInfo> {
        let group = self
            .groups
            .get(&group_id)
            .map(|g| g.clone())
            .ok_or(RegistryError::NotFound(group_id))?;

        let mut state = group.state.lock();
        if state.closed {
            return Err(RegistryError::NotFound(group_id));
        }
        self.remove_locked(&group, &mut state, key, reason)
            .ok_or(RegistryError::MemberNotFound { group_id, key })
    }

    /// Remove a member from every group it belongs to
    pub fn leave_all(&self, key: MemberKey, reason: RemovalReason) -> Vec<GroupId> {
        self.groups_of(key)
            .into_iter()
            .filter(|group_id| self.leave(*group_id, key, reason).is_ok())
            .collect()
    }

    fn remove_locked(
        &self,
        group: &Arc<Group>,
        state: &mut GroupState,
        key: MemberKey,
        reason: RemovalReason,
    ) -> Option<MemberInfo> {
        let mut member = state.members.remove(&key)?;
        member.cancel_timer();
        self.release_membership(group.id, key);

        let mut receivers = state.receivers();
        receivers.push(member.info.clone());
        self.notifier.notify(
            &receivers,
            &GroupEvent::MemberLeft {
                group_id: group.id,
                member: member.info.clone(),
                reason,
            },
        );
        debug!(group_id = group.id, key = key, reason = ?reason, "Member removed");

        if state.members.is_empty() {
            self.destroy_locked(group, state);
        }
        Some(member.info)
    }

    /// Arm (or re-arm) a member's idle timer. When it fires the member is
    /// removed with [`RemovalReason::IdleTimeout`] unless it was cancelled or
    /// replaced first.
    pub fn schedule_eviction(
        self: &Arc<Self>,
        group_id: GroupId,
        key: MemberKey,
        after: Duration,
    ) -> RegistryResult<EvictionHandle> {
        let group = self
            .groups
            .get(&group_id)
            .map(|g| g.clone())
            .ok_or(RegistryError::NotFound(group_id))?;

        let mut state = group.state.lock();
        if state.closed {
            return Err(RegistryError::NotFound(group_id));
        }
        let member = state
            .members
            .get_mut(&key)
            .ok_or(RegistryError::MemberNotFound { group_id, key })?;

        member.cancel_timer();
        let timer_id = self.next_timer_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        member.timer = Some(IdleTimer {
            id: timer_id,
            token: token.clone(),
        });

        let registry: Weak<GroupRegistry> = Arc::downgrade(self);
        let timer_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => return,
                _ = tokio::time::sleep(after) => {}
            }
            if let Some(registry) = registry.upgrade() {
                registry.expire(group_id, key, timer_id);
            }
        });

        Ok(EvictionHandle {
            group_id,
            key,
            timer_id,
            token,
        })
    }

    /// Timer callback. Removes the member only if this exact timer is still armed.
    fn expire(&self, group_id: GroupId, key: MemberKey, timer_id: u64) -> bool {
        let Some(group) = self.groups.get(&group_id).map(|g| g.clone()) else {
            return false;
        };
        let mut state = group.state.lock();
        if state.closed {
            return false;
        }
        let armed = state.members.get(&key).is_some_and(|member| {
            member
                .timer
                .as_ref()
                .is_some_and(|t| t.id == timer_id && !t.token.is_cancelled())
        });
        if !armed {
            return false;
        }
        self.remove_locked(&group, &mut state, key, RemovalReason::IdleTimeout)
            .is_some()
    }

    /// Record activity: re-arm the member's idle timer with the configured
    /// timeout. Fails if the member is not in the group.
    pub fn touch(self: &Arc<Self>, group_id: GroupId, key: MemberKey) -> RegistryResult<()> {
        match self.idle_timeout {
            Some(after) => self.schedule_eviction(group_id, key, after).map(|_| ()),
            None => self.members(group_id).and_then(|members| {
                if members.iter().any(|m| m.key == key) {
                    Ok(())
                } else {
                    Err(RegistryError::MemberNotFound { group_id, key })
                }
            }),
        }
    }

    /// Send an event to every member. Returns the number of receivers.
    pub fn broadcast(&self, group_id: GroupId, event: &GroupEvent) -> RegistryResult<usize> {
        let group = self
            .groups
            .get(&group_id)
            .map(|g| g.clone())
            .ok_or(RegistryError::NotFound(group_id))?;

        let state = group.state.lock();
        if state.closed {
            return Err(RegistryError::NotFound(group_id));
        }
        let receivers = state.receivers();
        self.notifier.notify(&receivers, event);
        Ok(receivers.len())
    }

    /// Broadcast a chat line from a member and re-arm the sender's idle timer
    pub fn chat(
        self: &Arc<Self>,
        group_id: GroupId,
        key: MemberKey,
        message: String,
    ) -> RegistryResult<usize> {
        let delivered = {
            let group = self
                .groups
                .get(&group_id)
                .map(|g| g.clone())
                .ok_or(RegistryError::NotFound(group_id))?;

            let state = group.state.lock();
            if state.closed {
                return Err(RegistryError::NotFound(group_id));
            }
            let sender = state
                .members
                .get(&key)
                .ok_or(RegistryError::MemberNotFound { group_id, key })?;
            let event = GroupEvent::Chat {
                group_id,
                from: sender.info.name.clone(),
                message,
            };
            let receivers = state.receivers();
            self.notifier.notify(&receivers, &event);
            receivers.len()
        };

        // The sender may have left in between; chat already went out
        let _ = self.touch(group_id, key);
        Ok(delivered)
    }

    /// Snapshot of a group's members
    pub fn members(&self, group_id: GroupId) -> RegistryResult<Vec<MemberInfo>> {
        let group = self
            .groups
            .get(&group_id)
            .map(|g| g.clone())
            .ok_or(RegistryError::NotFound(group_id))?;
        let state = group.state.lock();
        if state.closed {
            return Err(RegistryError::NotFound(group_id));
        }
        Ok(state.receivers())
    }

    /// Force-remove every member, notify them and destroy the group.
    /// Returns the number of members removed.
    pub fn disband(&self, group_id: GroupId) -> RegistryResult<usize> {
        let group = self
            .groups
            .get(&group_id)
            .map(|g| g.clone())
            .ok_or(RegistryError::NotFound(group_id))?;

        let mut state = group.state.lock();
        if state.closed {
            return Err(RegistryError::NotFound(group_id));
        }
        let receivers = state.receivers();
        for (key, mut member) in state.members.drain() {
            member.cancel_timer();
            self.release_membership(group_id, key);
        }
        self.notifier
            .notify(&receivers, &GroupEvent::Disbanded { group_id });
        self.destroy_locked(&group, &mut state);

        info!(group_id = group_id, members = receivers.len(), "Group disbanded");
        Ok(receivers.len())
    }

    /// Groups a member currently belongs to, ascending
    pub fn groups_of(&self, key: MemberKey) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self
            .memberships
            .get(&key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        groups.sort_unstable();
        groups
    }

    /// Disband every group (shutdown)
    pub fn clear(&self) {
        let ids: Vec<GroupId> = self.groups.iter().map(|g| *g.key()).collect();
        for id in ids {
            let _ = self.disband(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<(Vec<MemberKey>, GroupEvent)>>,
    }

    impl RecordingNotifier {
        fn left_count(&self, group_id: GroupId, key: MemberKey) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|(_, event)| {
                    matches!(event, GroupEvent::MemberLeft { group_id: g, member, .. }
                        if *g == group_id && member.key == key)
                })
                .count()
        }
    }

    impl GroupNotifier for RecordingNotifier {
        fn notify(&self, receivers: &[MemberInfo], event: &GroupEvent) {
            let mut keys: Vec<MemberKey> = receivers.iter().map(|m| m.key).collect();
            keys.sort_unstable();
            self.events.lock().push((keys, event.clone()));
        }
    }

    fn member(key: MemberKey) -> MemberInfo {
        MemberInfo {
            key,
            name: format!("player{}", key),
            channel: 1,
            online: true,
        }
    }

    fn timer_armed(registry: &GroupRegistry, group_id: GroupId, key: MemberKey) -> bool {
        let Some(group) = registry.groups.get(&group_id).map(|g| g.clone()) else {
            return false;
        };
        let state = group.state.lock();
        state
            .members
            .get(&key)
            .and_then(|m| m.timer.as_ref())
            .is_some_and(|t| !t.token.is_cancelled())
    }

    fn registry(limits: GroupLimits) -> (Arc<GroupRegistry>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        (GroupRegistry::new(limits, None, notifier.clone()), notifier)
    }

    #[test]
    fn test_join_conflict_leaves_group_unchanged() {
        let (registry, notifier) = registry(GroupLimits::default());
        let group_id = registry.create(member(1)).unwrap();
        registry.join(group_id, member(2)).unwrap();
        let events_before = notifier.events.lock().len();

        let mut renamed = member(2);
        renamed.name = "impostor".into();
        let err = registry.join(group_id, renamed).unwrap_err();

        assert_eq!(err, RegistryError::Conflict { group_id, key: 2 });
        assert_eq!(registry.members(group_id).unwrap().len(), 2);
        assert!(registry
            .members(group_id)
            .unwrap()
            .iter()
            .all(|m| m.name != "impostor"));
        assert_eq!(notifier.events.lock().len(), events_before);
    }

    #[test]
    fn test_last_leave_destroys_group() {
        let (registry, _) = registry(GroupLimits::default());
        let group_id = registry.create(member(1)).unwrap();
        registry.join(group_id, member(2)).unwrap();

        registry.leave(group_id, 1, RemovalReason::Left).unwrap();
        assert!(registry.contains(group_id));
        registry.leave(group_id, 2, RemovalReason::Left).unwrap();

        assert!(!registry.contains(group_id));
        assert!(registry.is_empty());
        assert_eq!(
            registry.join(group_id, member(3)),
            Err(RegistryError::NotFound(group_id))
        );
        assert!(registry.groups_of(1).is_empty());
    }

    #[test]
    fn test_leave_notifies_remaining_and_leaver() {
        let (registry, notifier) = registry(GroupLimits::default());
        let group_id = registry.create(member(1)).unwrap();
        registry.join(group_id, member(2)).unwrap();
        registry.join(group_id, member(3)).unwrap();

        registry.leave(group_id, 2, RemovalReason::Left).unwrap();

        let events = notifier.events.lock();
        let (receivers, event) = events.last().unwrap();
        assert_eq!(receivers, &vec![1, 2, 3]);
        assert_eq!(
            event,
            &GroupEvent::MemberLeft {
                group_id,
                member: member(2),
                reason: RemovalReason::Left
            }
        );
    }

    #[test]
    fn test_capacity_limits() {
        let limits = GroupLimits {
            max_members: 2,
            max_groups_per_member: 1,
        };
        let (registry, _) = registry(limits);
        let group_id = registry.create(member(1)).unwrap();
        registry.join(group_id, member(2)).unwrap();

        assert_eq!(
            registry.join(group_id, member(3)),
            Err(RegistryError::ResourceExhausted(GroupLimit::GroupFull {
                group_id,
                max: 2
            }))
        );
        assert_eq!(
            registry.create(member(1)),
            Err(RegistryError::ResourceExhausted(GroupLimit::TooManyGroups {
                key: 1,
                max: 1
            }))
        );
    }

    #[test]
    fn test_join_or_create() {
        let (registry, _) = registry(GroupLimits::default());
        let members = registry.join_or_create(77, member(1)).unwrap();
        assert_eq!(members, vec![member(1)]);

        let members = registry.join_or_create(77, member(2)).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(registry.groups_of(2), vec![77]);
    }

    #[test]
    fn test_failed_join_or_create_leaves_no_empty_group() {
        let limits = GroupLimits {
            max_members: 5,
            max_groups_per_member: 1,
        };
        let (registry, _) = registry(limits);
        registry.create(member(1)).unwrap();

        assert!(registry.join_or_create(50, member(1)).is_err());
        assert!(!registry.contains(50));
    }

    #[test]
    fn test_disband_notifies_everyone() {
        let (registry, notifier) = registry(GroupLimits::default());
        let group_id = registry.create(member(1)).unwrap();
        registry.join(group_id, member(2)).unwrap();

        assert_eq!(registry.disband(group_id).unwrap(), 2);
        assert!(!registry.contains(group_id));
        assert!(registry.groups_of(1).is_empty());

        let events = notifier.events.lock();
        let (receivers, event) = events.last().unwrap();
        assert_eq!(receivers, &vec![1, 2]);
        assert_eq!(event, &GroupEvent::Disbanded { group_id });
    }

    #[test]
    fn test_leave_all() {
        let (registry, _) = registry(GroupLimits::default());
        let a = registry.create(member(1)).unwrap();
        let b = registry.create(member(2)).unwrap();
        registry.join(b, member(1)).unwrap();

        let left = registry.leave_all(1, RemovalReason::Disconnected);
        assert_eq!(left, vec![a, b]);
        assert!(!registry.contains(a));
        assert_eq!(registry.members(b).unwrap(), vec![member(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_fires() {
        let (registry, notifier) = registry(GroupLimits::default());
        let group_id = registry.create(member(1)).unwrap();
        registry.join(group_id, member(2)).unwrap();

        registry
            .schedule_eviction(group_id, 2, Duration::from_millis(100))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(registry.members(group_id).unwrap(), vec![member(1)]);
        assert_eq!(notifier.left_count(group_id, 2), 1);
        let events = notifier.events.lock();
        assert!(matches!(
            events.last().unwrap().1,
            GroupEvent::MemberLeft {
                reason: RemovalReason::IdleTimeout,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_eviction_does_not_fire() {
        let (registry, notifier) = registry(GroupLimits::default());
        let group_id = registry.create(member(1)).unwrap();

        let handle = registry
            .schedule_eviction(group_id, 1, Duration::from_millis(100))
            .unwrap();
        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(registry.contains(group_id));
        assert_eq!(notifier.left_count(group_id, 1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_rearms_timer() {
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = GroupRegistry::new(
            GroupLimits::default(),
            Some(Duration::from_millis(100)),
            notifier.clone(),
        );
        let group_id = registry.create(member(1)).unwrap();
        registry.join(group_id, member(2)).unwrap();

        registry.touch(group_id, 2).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.chat(group_id, 2, "still here".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.members(group_id).unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.members(group_id).unwrap(), vec![member(1)]);
        assert_eq!(notifier.left_count(group_id, 2), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leave_racing_timer_removes_once() {
        let (registry, notifier) = registry(GroupLimits {
            max_members: 4,
            max_groups_per_member: 1,
        });

        let mut groups = Vec::new();
        for i in 0..100 {
            let owner = 1_000 + i;
            let group_id = registry.create(member(owner)).unwrap();
            registry.join(group_id, member(i)).unwrap();
            registry
                .schedule_eviction(group_id, i, Duration::from_millis(5))
                .unwrap();
            groups.push((group_id, i));
        }

        let mut racers = Vec::new();
        for &(group_id, key) in &groups {
            let registry = registry.clone();
            racers.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = registry.leave(group_id, key, RemovalReason::Left);
            }));
        }
        for racer in racers {
            racer.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (group_id, key) in groups {
            assert_eq!(notifier.left_count(group_id, key), 1);
            assert_eq!(registry.members(group_id).unwrap().len(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_timer_at_deadline() {
        let (registry, notifier) = registry(GroupLimits {
            max_members: 4,
            max_groups_per_member: 1,
        });

        let mut handles = Vec::new();
        for i in 0..200 {
            let owner = 1_000 + i;
            let group_id = registry.create(member(owner)).unwrap();
            registry.join(group_id, member(i)).unwrap();
            let handle = registry
                .schedule_eviction(group_id, i, Duration::from_millis(5))
                .unwrap();
            handles.push(handle);
        }

        let mut racers = Vec::new();
        for handle in handles.clone() {
            racers.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                handle.cancel();
            }));
        }
        for racer in racers {
            racer.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        for handle in &handles {
            let (group_id, key) = (handle.group_id, handle.key);
            handle.cancel();
            assert!(handle.is_cancelled());
            assert!(!timer_armed(&registry, group_id, key));

            let still_member = registry
                .members(group_id)
                .unwrap()
                .iter()
                .any(|m| m.key == key);
            let left = notifier.left_count(group_id, key);
            assert!(left <= 1);
            assert_eq!(still_member, left == 0);
        }

        // Survivors stay put once the deadline has long passed
        tokio::time::sleep(Duration::from_millis(30)).await;
        for handle in &handles {
            assert!(notifier.left_count(handle.group_id, handle.key) <= 1);
        }
    }
}
