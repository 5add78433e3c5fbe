//! Game module
//!
//! - `persistence`: the storage collaborator and its in-memory implementation
//! - `world`: the per-process tick loop

pub mod persistence;
pub mod world;
