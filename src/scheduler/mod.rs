//! Task scheduling
//!
//! - [`Schedule`]: time-ordered, one-task-per-zone queue with worker wakeups
//! - [`Task`] / [`Stage`]: scheduled work and the per-zone stage machine
//! - [`BackoffPolicy`]: retry spacing for failing stages

pub mod backoff;
pub mod schedule;
pub mod task;

pub use backoff::BackoffPolicy;
pub use schedule::{Queue, Schedule};
pub use task::{Halted, Stage, StageState, Task};
