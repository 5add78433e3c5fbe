//! Entity behavior selection
//!
//! - `task`: per-entity priority-preemption scheduler
//! - `entity`: the process-wide entity table ticked by the world loop

pub mod entity;
pub mod task;

pub use entity::{Behavior, EntityId, EntityKind, EntityTable};
pub use task::{ProposalOutcome, Task, TaskPriority, TaskScheduler, Tick};
