//! Keeps the host artifact warm by regenerating it whenever the store expires it.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use metrics::counter;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::HostSettings,
    domain::types::{ArtifactKey, GenerationRequest},
    store::ArtifactStore,
};

use super::jobs::{JobQueue, JobSource, QueueError, Submission};

pub struct ExpirationWatcher {
    store: Arc<dyn ArtifactStore>,
    queue: JobQueue,
    host: ArtifactKey,
    pattern: String,
    resubscribe_delay: Duration,
}

enum Flow {
    Continue,
    Stop,
}

impl ExpirationWatcher {
    pub fn new(store: Arc<dyn ArtifactStore>, queue: JobQueue, host: &HostSettings) -> Self {
        Self {
            store,
            queue,
            host: host.key.clone(),
            pattern: host.notification_pattern.clone(),
            resubscribe_delay: host.resubscribe_delay,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Watch for host expirations until `shutdown` flips or the queue closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                subscribed = self.store.subscribe(&self.pattern) => subscribed,
            };

            let mut events = match subscribed {
                Ok(events) => events,
                Err(err) => {
                    error!(
                        target = "certcache::watcher",
                        pattern = %self.pattern,
                        error = %err,
                        "failed to subscribe to expirations"
                    );
                    if sleep_or_shutdown(&mut shutdown, self.resubscribe_delay).await {
                        break;
                    }
                    continue;
                }
            };
            info!(
                target = "certcache::watcher",
                pattern = %self.pattern,
                host = %self.host,
                "watching host expirations"
            );

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    next = events.next() => next,
                };

                match next {
                    Some(Ok(event)) => {
                        info!(
                            target = "certcache::watcher",
                            key = %event.key,
                            host = %self.host,
                            "host artifact expired, regenerating"
                        );
                        counter!("certcache_watcher_events_total").increment(1);
                        if let Flow::Stop = self.submit_host(&mut shutdown).await {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        error!(
                            target = "certcache::watcher",
                            error = %err,
                            "error receiving expiration notification"
                        );
                    }
                    None => {
                        warn!(
                            target = "certcache::watcher",
                            pattern = %self.pattern,
                            delay_ms = self.resubscribe_delay.as_millis() as u64,
                            "expiration subscription ended, resubscribing"
                        );
                        break;
                    }
                }
            }

            if sleep_or_shutdown(&mut shutdown, self.resubscribe_delay).await {
                break;
            }
        }

        debug!(target = "certcache::watcher", "watcher stopped");
    }

    /// Submit one host request. A full queue is retried after the resubscribe
    /// delay so an expiration is never silently lost.
    async fn submit_host(&self, shutdown: &mut watch::Receiver<bool>) -> Flow {
        loop {
            let request = GenerationRequest::new(self.host.clone());
            let submitted = tokio::select! {
                biased;
                _ = shutdown.changed() => return Flow::Stop,
                submitted = self.queue.submit(request, JobSource::Watcher) => submitted,
            };

            match submitted {
                Ok(Submission::Accepted) => return Flow::Continue,
                Ok(Submission::AlreadyInFlight) => {
                    debug!(
                        target = "certcache::watcher",
                        host = %self.host,
                        "host regeneration already in flight"
                    );
                    return Flow::Continue;
                }
                Err(QueueError::Full) => {
                    warn!(
                        target = "certcache::watcher",
                        host = %self.host,
                        "job queue full, retrying host submission"
                    );
                    if sleep_or_shutdown(shutdown, self.resubscribe_delay).await {
                        return Flow::Stop;
                    }
                }
                Err(QueueError::Closed) => {
                    info!(
                        target = "certcache::watcher",
                        "job queue closed, stopping watcher"
                    );
                    return Flow::Stop;
                }
            }
        }
    }
}

/// Sleep for `delay`; returns `true` if shutdown fired first.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
