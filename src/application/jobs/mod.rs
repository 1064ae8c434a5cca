//! Artifact generation jobs: the queue, the worker pool, and the runner they share.

mod inflight;
mod outcome;
mod pool;
mod queue;
mod runner;
mod worker;

pub use inflight::{InFlightError, InFlightGuard, InFlightKeys};
pub use outcome::JobOutcome;
pub use pool::{PoolConfig, ShutdownReport, WorkerPool};
pub use queue::{JobQueue, JobReceiver, JobSource, QueueError, QueuedJob, Submission, channel};
pub use runner::JobRunner;
