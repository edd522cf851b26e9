//! Dispatch core: routes inbound work to handlers and runs it under a
//! bounded, priority-partitioned concurrency budget.
//!
//! - [`Router`] picks a handler for a [`RoutingKey`](switchyard_core::RoutingKey)
//! - [`Scheduler`] queues, launches, times out and kills work
//! - [`Dispatcher`] composes the two behind one surface

pub mod autotune;
pub mod availability;
pub mod cancel;
pub mod cpu;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod observer;
pub mod process;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod work;

pub use autotune::{AutotuneSample, AutotuneSnapshot};
pub use availability::{AdmissionBudget, AvailabilityManager, AvailabilitySnapshot};
pub use cancel::CancelSignal;
pub use cpu::{CpuProbe, NullProbe, ProcStatProbe, ProcessCpuProbe};
pub use dispatcher::Dispatcher;
pub use envelope::Envelope;
pub use error::{DispatchError, WorkError};
pub use metrics::{CallerStats, CounterSnapshot, LevelSnapshot, SchedulerSnapshot};
pub use observer::{ChannelObserver, LifecycleEvent, LifecycleObserver};
pub use process::{HousekeepingProcess, StatisticsLogger};
pub use queue::PriorityQueue;
pub use router::{handler_fn, MessageHandler, Router};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerState};
pub use work::{WorkId, WorkKind, WorkOutcome, WorkReport, WorkRequest, WorkState};
