//! Contains the building blocks that jobs are made of and that drive them.
//!
//! `task` defines what a job runs. `timer` fires notifications on a
//! schedule, and `manager` holds the per-frame jobs of the system and
//! simulation domains. The `Scheduler` wires these together.

pub mod manager;
pub mod task;
pub mod timer;
