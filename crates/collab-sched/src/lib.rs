//! Collab Scheduler - Cooperative job runner
//!
//! A job is a lazy sequence of steps, each step an awaitable unit of work.
//! The scheduler:
//! - Advances one job by one step per tick, round-robin
//! - Isolates jobs from each other's errors and panics
//! - Lets callers stop a job between steps
//! - Reports load figures used by load balancing

pub mod scheduler;
pub mod task;

pub use scheduler::*;
pub use task::*;
