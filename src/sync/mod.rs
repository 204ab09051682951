//! Periodic scheduling, job execution and application of provider changes to
//! the local mirror.

pub mod folders;
pub mod persist;
pub mod scheduler;
pub mod worker;

pub use scheduler::SyncScheduler;
pub use worker::{JobError, SyncWorker, WorkerPool, WorkerSettings};
