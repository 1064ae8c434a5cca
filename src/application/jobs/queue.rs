use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    time::Instant,
};
use tracing::debug;

use crate::{config::QueueFullPolicy, domain::types::GenerationRequest};

use super::inflight::{InFlightGuard, InFlightKeys};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("job queue is full")]
    Full,
    #[error("job queue is closed")]
    Closed,
}

/// Result of a submission that reached the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A worker has taken (capacity 0) or will take the job.
    Accepted,
    /// Deduplication is on and the key already has a queued or running job.
    AlreadyInFlight,
}

/// Producer that submitted a request; used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Gateway,
    Watcher,
    Startup,
}

impl JobSource {
    pub fn as_str(self) -> &'static str {
        match self {
            JobSource::Gateway => "gateway",
            JobSource::Watcher => "watcher",
            JobSource::Startup => "startup",
        }
    }
}

/// A request travelling through the queue to a worker.
#[derive(Debug)]
pub struct QueuedJob {
    pub request: GenerationRequest,
    pub source: JobSource,
    pub enqueued_at: Instant,
    ack: Option<oneshot::Sender<()>>,
    _guard: Option<InFlightGuard>,
}

impl QueuedJob {
    fn new(
        request: GenerationRequest,
        source: JobSource,
        ack: Option<oneshot::Sender<()>>,
        guard: Option<InFlightGuard>,
    ) -> Self {
        Self {
            request,
            source,
            enqueued_at: Instant::now(),
            ack,
            _guard: guard,
        }
    }

    /// Tell a waiting submitter that a worker has taken this job.
    pub(crate) fn acknowledge(&mut self) {
        if let Some(ack) = self.ack.take() {
            // The submitter may have given up waiting.
            let _ = ack.send(());
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum QueueMode {
    Rendezvous,
    Buffered(QueueFullPolicy),
}

/// Cloneable producer side of the generation queue.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<QueuedJob>,
    mode: QueueMode,
    in_flight: Option<InFlightKeys>,
}

/// Consumer side shared by every worker; each job is received exactly once.
#[derive(Clone)]
pub struct JobReceiver {
    inner: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
}

/// Build a queue.
///
/// With `capacity == 0` a submission completes only once a worker has taken
/// the job. Otherwise up to `capacity` jobs wait in the buffer and `policy`
/// decides what a submission does when it is full.
pub fn channel(
    capacity: usize,
    policy: QueueFullPolicy,
    dedupe_in_flight: bool,
) -> (JobQueue, JobReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let mode = if capacity == 0 {
        QueueMode::Rendezvous
    } else {
        QueueMode::Buffered(policy)
    };
    let queue = JobQueue {
        sender,
        mode,
        in_flight: dedupe_in_flight.then(InFlightKeys::new),
    };
    let receiver = JobReceiver {
        inner: Arc::new(Mutex::new(receiver)),
    };
    (queue, receiver)
}

impl JobQueue {
    pub async fn submit(
        &self,
        request: GenerationRequest,
        source: JobSource,
    ) -> Result<Submission, QueueError> {
        let guard = match &self.in_flight {
            Some(in_flight) => match in_flight.acquire(&request.key) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    debug!(
                        target = "certcache::queue",
                        key = %request.key,
                        source = source.as_str(),
                        reason = %err,
                        "skipped duplicate submission"
                    );
                    counter!("certcache_queue_deduplicated_total").increment(1);
                    return Ok(Submission::AlreadyInFlight);
                }
            },
            None => None,
        };

        match self.mode {
            QueueMode::Rendezvous => {
                let (ack_tx, ack_rx) = oneshot::channel();
                let job = QueuedJob::new(request, source, Some(ack_tx), guard);
                self.sender
                    .send(job)
                    .await
                    .map_err(|_| QueueError::Closed)?;
                // Dropped without an ack means the queue was drained at shutdown.
                ack_rx.await.map_err(|_| QueueError::Closed)?;
            }
            QueueMode::Buffered(QueueFullPolicy::Block) => {
                let job = QueuedJob::new(request, source, None, guard);
                self.sender
                    .send(job)
                    .await
                    .map_err(|_| QueueError::Closed)?;
            }
            QueueMode::Buffered(QueueFullPolicy::Reject) => {
                let job = QueuedJob::new(request, source, None, guard);
                match self.sender.try_send(job) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        counter!("certcache_queue_rejected_total").increment(1);
                        return Err(QueueError::Full);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return Err(QueueError::Closed),
                }
            }
        }

        counter!("certcache_queue_submitted_total", "source" => source.as_str()).increment(1);
        Ok(Submission::Accepted)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// The in-flight set when deduplication is enabled.
    pub fn in_flight(&self) -> Option<&InFlightKeys> {
        self.in_flight.as_ref()
    }
}

impl JobReceiver {
    /// Wait for the next job. `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<QueuedJob> {
        self.inner.lock().await.recv().await
    }

    /// Close the queue and discard everything still buffered, returning how many
    /// jobs were dropped. Submitters waiting on a dropped job observe `Closed`.
    pub async fn close_and_drain(&self) -> usize {
        let mut receiver = self.inner.lock().await;
        receiver.close();
        let mut dropped = 0;
        while let Ok(job) = receiver.try_recv() {
            debug!(
                target = "certcache::queue",
                key = %job.request.key,
                source = job.source.as_str(),
                "dropped queued job at shutdown"
            );
            dropped += 1;
        }
        dropped
    }
}
