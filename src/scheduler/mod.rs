//! Request scheduling: admission policy, the worker pool, dispatch and
//! completion, and periodic maintenance.

pub mod admission;
pub(crate) mod dispatch;
mod sweeper;
mod worker_pool;

pub use admission::{AdmissionInput, AdmissionLimits, Decision, DeferReason};
pub use dispatch::{Dispatcher, Received, SweepReport};
pub use sweeper::spawn_sweeper;
pub use worker_pool::{
    ExitHook, Job, SubmitError, Task, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    WorkerPoolStats,
};
