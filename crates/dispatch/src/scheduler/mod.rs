//! Scheduler -- the control loop tying queueing, timeouts and capacity together.
//!
//! Split into focused submodules:
//! - `core`: Scheduler handle, builder, lifecycle and submission API
//! - `shared`: state shared between the handle, the control loop and work tasks
//! - `control`: the control loop pass (sweeps, launch, autotune, housekeeping)
//! - `execution`: launching work and the completion continuation

mod control;
mod core;
mod execution;
mod shared;
#[cfg(test)]
mod tests;

pub use self::core::{Scheduler, SchedulerBuilder, SchedulerState};
