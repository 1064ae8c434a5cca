use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::{
    domain::types::{Artifact, ArtifactKey, GenerationRequest},
    store::ArtifactStore,
};

use super::jobs::{JobQueue, JobSource, QueueError, Submission};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Artifact),
    Miss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    Ready(Artifact),
    /// Not cached; a generation request has been handed to the workers.
    Accepted(Submission),
}

/// Read-through front of the cache: serve what the store has, queue the rest.
///
/// The gateway never generates or writes artifacts itself.
#[derive(Clone)]
pub struct CacheGateway {
    store: Arc<dyn ArtifactStore>,
    queue: JobQueue,
}

impl CacheGateway {
    pub fn new(store: Arc<dyn ArtifactStore>, queue: JobQueue) -> Self {
        Self { store, queue }
    }

    /// Read `key` from the store. Read errors and empty values count as a miss.
    pub async fn lookup(&self, key: &ArtifactKey) -> Lookup {
        match self.store.get(key).await {
            Ok(Some(artifact)) if !artifact.value.is_empty() => {
                counter!("certcache_lookup_total", "result" => "hit").increment(1);
                Lookup::Hit(artifact)
            }
            Ok(_) => {
                counter!("certcache_lookup_total", "result" => "miss").increment(1);
                Lookup::Miss
            }
            Err(err) => {
                counter!("certcache_store_read_error_total").increment(1);
                warn!(
                    target = "certcache::gateway",
                    key = %key,
                    error = %err,
                    "store read failed, treating as miss"
                );
                Lookup::Miss
            }
        }
    }

    /// Submit a generation request for `key` without consulting the store.
    pub async fn request(&self, key: ArtifactKey) -> Result<Submission, QueueError> {
        debug!(target = "certcache::gateway", key = %key, "requesting generation");
        self.queue
            .submit(GenerationRequest::new(key), JobSource::Gateway)
            .await
    }

    /// Lookup, then request generation on a miss.
    pub async fn fetch(&self, key: ArtifactKey) -> Result<Fetch, QueueError> {
        match self.lookup(&key).await {
            Lookup::Hit(artifact) => Ok(Fetch::Ready(artifact)),
            Lookup::Miss => self.request(key).await.map(Fetch::Accepted),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        application::jobs,
        config::QueueFullPolicy,
        store::{ExpirationStream, MemoryStore, StoreError},
    };

    fn key(raw: &str) -> ArtifactKey {
        ArtifactKey::parse(raw).expect("valid key")
    }

    struct UnreachableStore;

    #[async_trait]
    impl ArtifactStore for UnreachableStore {
        async fn get(&self, _key: &ArtifactKey) -> Result<Option<Artifact>, StoreError> {
            Err(StoreError::connection("connection refused"))
        }

        async fn set(
            &self,
            _key: &ArtifactKey,
            _value: &str,
            _ttl: Duration,
        ) -> Result<(), StoreError> {
            Err(StoreError::connection("connection refused"))
        }

        async fn subscribe(&self, _pattern: &str) -> Result<ExpirationStream, StoreError> {
            Err(StoreError::connection("connection refused"))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::connection("connection refused"))
        }
    }

    #[tokio::test]
    async fn hit_serves_value_without_enqueueing() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        store
            .set(&key("example.org"), "foo-example.org", Duration::from_secs(600))
            .await
            .expect("set succeeds");
        let (queue, receiver) = jobs::channel(4, QueueFullPolicy::Block, false);
        let gateway = CacheGateway::new(store, queue.clone());

        let fetched = gateway.fetch(key("example.org")).await.expect("fetch");
        match fetched {
            Fetch::Ready(artifact) => assert_eq!(artifact.value, "foo-example.org"),
            other => panic!("unexpected fetch result: {other:?}"),
        }

        drop(gateway);
        drop(queue);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn each_miss_enqueues_exactly_one_request() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let (queue, receiver) = jobs::channel(4, QueueFullPolicy::Block, false);
        let gateway = CacheGateway::new(store, queue.clone());

        for _ in 0..2 {
            assert_eq!(
                gateway.fetch(key("example.org")).await,
                Ok(Fetch::Accepted(Submission::Accepted))
            );
        }
        drop(gateway);
        drop(queue);

        let mut received = Vec::new();
        while let Some(job) = receiver.recv().await {
            assert_eq!(job.source, JobSource::Gateway);
            received.push(job.request.key.to_string());
        }
        assert_eq!(received, vec!["example.org", "example.org"]);
    }

    #[tokio::test]
    async fn read_error_is_treated_as_miss() {
        let (queue, receiver) = jobs::channel(1, QueueFullPolicy::Block, false);
        let gateway = CacheGateway::new(Arc::new(UnreachableStore), queue);

        assert_eq!(gateway.lookup(&key("example.org")).await, Lookup::Miss);
        assert_eq!(
            gateway.fetch(key("example.org")).await,
            Ok(Fetch::Accepted(Submission::Accepted))
        );
        assert!(receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn empty_value_is_treated_as_miss() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        store
            .set(&key("example.org"), "", Duration::from_secs(600))
            .await
            .expect("set succeeds");
        let (queue, _receiver) = jobs::channel(1, QueueFullPolicy::Block, false);
        let gateway = CacheGateway::new(store, queue);

        assert_eq!(gateway.lookup(&key("example.org")).await, Lookup::Miss);
    }

    #[tokio::test]
    async fn dedupe_reports_already_in_flight() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let (queue, _receiver) = jobs::channel(4, QueueFullPolicy::Block, true);
        let gateway = CacheGateway::new(store, queue);

        assert_eq!(
            gateway.request(key("example.org")).await,
            Ok(Submission::Accepted)
        );
        assert_eq!(
            gateway.fetch(key("example.org")).await,
            Ok(Fetch::Accepted(Submission::AlreadyInFlight))
        );
    }

    #[tokio::test]
    async fn full_queue_surfaces_as_error() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(60)));
        let (queue, _receiver) = jobs::channel(1, QueueFullPolicy::Reject, false);
        let gateway = CacheGateway::new(store, queue);

        gateway
            .request(key("a.example.org"))
            .await
            .expect("first accepted");
        assert_eq!(
            gateway.fetch(key("b.example.org")).await,
            Err(QueueError::Full)
        );
    }
}
