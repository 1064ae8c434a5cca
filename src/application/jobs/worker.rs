use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use super::{
    outcome::JobOutcome,
    queue::{JobReceiver, QueuedJob},
    runner::JobRunner,
};

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) runner: JobRunner,
    pub(crate) jobs: JobReceiver,
    pub(crate) pause: Duration,
    pub(crate) outcomes: broadcast::Sender<JobOutcome>,
}

impl Worker {
    /// Take jobs until shutdown is signalled or the queue closes.
    ///
    /// Shutdown is only observed between jobs: a job that has been taken always
    /// runs to completion, and the post-job pause is cut short.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(target = "certcache::worker", worker = self.id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let job = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.process(job).await;

            if !self.pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }
        }

        debug!(target = "certcache::worker", worker = self.id, "worker stopped");
    }

    async fn process(&self, mut job: QueuedJob) {
        job.acknowledge();
        let key = job.request.key.clone();
        debug!(
            target = "certcache::worker",
            worker = self.id,
            key = %key,
            source = job.source.as_str(),
            queued_ms = job.enqueued_at.elapsed().as_millis() as u64,
            "job taken"
        );

        gauge!("certcache_workers_busy").increment(1.0);
        let outcome = self.runner.run(&key).await;
        gauge!("certcache_workers_busy").decrement(1.0);
        // Releases the in-flight entry, if any.
        drop(job);

        counter!("certcache_jobs_total", "outcome" => outcome.label()).increment(1);
        match &outcome {
            JobOutcome::Stored {
                key,
                attempts,
                elapsed,
            } => info!(
                target = "certcache::worker",
                worker = self.id,
                key = %key,
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "artifact stored"
            ),
            JobOutcome::GenerationFailed { key, reason } => error!(
                target = "certcache::worker",
                worker = self.id,
                key = %key,
                reason = %reason,
                "artifact generation failed"
            ),
            JobOutcome::StoreFailed {
                key,
                attempts,
                reason,
            } => error!(
                target = "certcache::worker",
                worker = self.id,
                key = %key,
                attempts,
                reason = %reason,
                "error storing artifact"
            ),
        }

        // Nobody listening is fine.
        let _ = self.outcomes.send(outcome);
    }
}
