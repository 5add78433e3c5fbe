//! Priority-preemption task scheduler
//!
//! Each entity runs at most one task. A proposal strictly higher than the
//! current task replaces it at once and the displaced task is dropped;
//! anything else waits in a bounded queue ordered by priority, then arrival.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::TaskError;

/// World tick counter
pub type Tick = u64;

/// Default queue bound per entity
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Task priority, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    Idle,
    BattleStandby,
    BattleMovement,
    BattleAction,
    OpportunisticLoot,
    Stun,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<P> {
    pub priority: TaskPriority,
    pub payload: P,
    pub enqueued_at: Tick,
    /// Arrival order, breaks ties between equal priorities
    pub seq: u64,
    pub expires_at: Option<Tick>,
}

impl<P> Task<P> {
    pub fn is_expired(&self, now: Tick) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Heap entry: max priority first, then lowest sequence
struct Queued<P>(Task<P>);

impl<P> Queued<P> {
    fn key(&self) -> (TaskPriority, Reverse<u64>) {
        (self.0.priority, Reverse(self.0.seq))
    }
}

impl<P> PartialEq for Queued<P> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<P> Eq for Queued<P> {}

impl<P> PartialOrd for Queued<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Queued<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Result of a proposal
#[derive(Debug, PartialEq, Eq)]
pub enum ProposalOutcome<P> {
    /// The proposal is now current. `displaced` is the task it preempted,
    /// which is discarded.
    Started { displaced: Option<Task<P>> },
    /// Waiting behind the current task
    Queued,
}

pub struct TaskScheduler<P> {
    current: Option<Task<P>>,
    queue: BinaryHeap<Queued<P>>,
    capacity: usize,
    next_seq: u64,
}

impl<P> Default for TaskScheduler<P> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl<P> TaskScheduler<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: None,
            queue: BinaryHeap::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn current(&self) -> Option<&Task<P>> {
        self.current.as_ref()
    }

    pub fn current_priority(&self) -> Option<TaskPriority> {
        self.current.as_ref().map(|t| t.priority)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Offer a task. `lifetime` is the number of ticks it stays valid.
    pub fn propose(
        &mut self,
        priority: TaskPriority,
        payload: P,
        now: Tick,
        lifetime: Option<Tick>,
    ) -> Result<ProposalOutcome<P>, TaskError> {
        self.reap(now);

        let seq = self.next_seq;
        let task = Task {
            priority,
            payload,
            enqueued_at: now,
            seq,
            expires_at: lifetime.map(|ticks| now.saturating_add(ticks)),
        };

        let preempts = match &self.current {
            None => true,
            Some(current) => priority > current.priority,
        };
        if preempts {
            self.next_seq += 1;
            let displaced = self.current.replace(task);
            return Ok(ProposalOutcome::Started { displaced });
        }

        if self.queue.len() >= self.capacity {
            return Err(TaskError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.next_seq += 1;
        self.queue.push(Queued(task));
        Ok(ProposalOutcome::Queued)
    }

    /// Finish the current task and promote the next one. Returns the
    /// finished task.
    pub fn complete(&mut self, now: Tick) -> Option<Task<P>> {
        let finished = self.current.take();
        self.promote(now);
        finished
    }

    /// Advance to `now`: drop an expired current task and promote.
    /// Returns the current task after the tick.
    pub fn tick(&mut self, now: Tick) -> Option<&Task<P>> {
        self.reap(now);
        self.current.as_ref()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.current = None;
        self.queue.clear();
    }

    fn reap(&mut self, now: Tick) {
        if self.current.as_ref().is_some_and(|t| t.is_expired(now)) {
            self.current = None;
        }
        if self.current.is_none() {
            self.promote(now);
        }
    }

    fn promote(&mut self, now: Tick) {
        while let Some(Queued(next)) = self.queue.pop() {
            if !next.is_expired(now) {
                self.current = Some(next);
                return;
            }
        }
    }
}
