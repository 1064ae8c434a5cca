use std::{num::NonZeroU32, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{error, info, warn};

use crate::{
    application::generator::ArtifactGenerator,
    config::{QueueFullPolicy, Settings},
    store::ArtifactStore,
};

use super::{
    outcome::JobOutcome,
    queue::{self, JobQueue, JobReceiver},
    runner::JobRunner,
    worker::Worker,
};

const OUTCOME_CHANNEL_CAPACITY: usize = 64;
/// Cap for a grace period too large to add to the clock.
const MAX_GRACE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Runtime knobs for the worker pool, derived from [`Settings`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: NonZeroU32,
    pub pause: Duration,
    pub ttl: Duration,
    pub store_write_attempts: NonZeroU32,
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub dedupe_in_flight: bool,
}

impl From<&Settings> for PoolConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            workers: settings.workers.count,
            pause: settings.workers.pause,
            ttl: settings.generation.ttl,
            store_write_attempts: settings.generation.store_write_attempts,
            queue_capacity: settings.workers.queue_capacity,
            queue_full_policy: settings.workers.queue_full_policy,
            dedupe_in_flight: settings.workers.dedupe_in_flight,
        }
    }
}

/// How the pool wound down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    /// Workers whose task had already died from a panic.
    pub failed: usize,
    pub aborted: usize,
    pub dropped_jobs: usize,
}

struct WorkerHandle {
    id: usize,
    handle: JoinHandle<()>,
}

/// A fixed set of long-lived generation workers sharing one queue.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    jobs: JobReceiver,
    shutdown: watch::Sender<bool>,
    outcomes: broadcast::Sender<JobOutcome>,
}

impl WorkerPool {
    /// Spawn the workers and return the pool with the producer handle for its queue.
    pub fn start(
        config: PoolConfig,
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn ArtifactGenerator>,
    ) -> (Self, JobQueue) {
        let (queue, jobs) = queue::channel(
            config.queue_capacity,
            config.queue_full_policy,
            config.dedupe_in_flight,
        );
        let (shutdown, _) = watch::channel(false);
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let runner = JobRunner::new(store, generator, config.ttl, config.store_write_attempts);

        let count = config.workers.get() as usize;
        let workers = (0..count)
            .map(|id| {
                let worker = Worker {
                    id,
                    runner: runner.clone(),
                    jobs: jobs.clone(),
                    pause: config.pause,
                    outcomes: outcomes.clone(),
                };
                WorkerHandle {
                    id,
                    handle: tokio::spawn(worker.run(shutdown.subscribe())),
                }
            })
            .collect();

        info!(
            target = "certcache::pool",
            workers = count,
            pause_ms = config.pause.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            queue_full_policy = config.queue_full_policy.as_str(),
            dedupe_in_flight = config.dedupe_in_flight,
            "worker pool started"
        );

        (
            Self {
                workers,
                jobs,
                shutdown,
                outcomes,
            },
            queue,
        )
    }

    /// A receiver that flips to `true` when the pool starts shutting down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Outcomes of jobs finished after this call.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }

    /// Signal every worker to stop and join them.
    ///
    /// Workers finish the job they hold. Any worker still running after `grace`
    /// is aborted. Jobs still waiting in the queue are dropped and their
    /// submitters observe a closed queue.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let _ = self.shutdown.send(true);
        let deadline = Instant::now()
            .checked_add(grace)
            .unwrap_or_else(|| Instant::now() + MAX_GRACE);
        let mut report = ShutdownReport::default();

        for mut worker in self.workers {
            match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(())) => report.joined += 1,
                Ok(Err(err)) => {
                    error!(
                        target = "certcache::pool",
                        worker = worker.id,
                        error = %err,
                        "worker task failed"
                    );
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(
                        target = "certcache::pool",
                        worker = worker.id,
                        grace_ms = grace.as_millis() as u64,
                        "worker did not stop in time, aborting"
                    );
                    worker.handle.abort();
                    let _ = worker.handle.await;
                    report.aborted += 1;
                }
            }
        }

        report.dropped_jobs = self.jobs.close_and_drain().await;

        info!(
            target = "certcache::pool",
            joined = report.joined,
            failed = report.failed,
            aborted = report.aborted,
            dropped_jobs = report.dropped_jobs,
            "worker pool stopped"
        );
        report
    }
}
