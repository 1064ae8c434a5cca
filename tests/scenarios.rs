use std::{num::NonZeroU32, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use certcache::{
    application::{
        gateway::{CacheGateway, Lookup},
        generator::PrefixGenerator,
        jobs::{JobOutcome, JobSource, PoolConfig, WorkerPool},
        watcher::ExpirationWatcher,
    },
    config::{HostSettings, QueueFullPolicy},
    domain::types::{ArtifactKey, GenerationRequest},
    infra::http::{HttpState, build_router},
    store::{ArtifactStore, MemoryStore, pattern::keyspace_pattern},
};
use tokio::{sync::broadcast, time::Instant};
use tower::ServiceExt;

const HOST: &str = "example.com";

fn pool_config(pause: Duration) -> PoolConfig {
    PoolConfig {
        workers: NonZeroU32::MIN,
        pause,
        ttl: Duration::from_secs(600),
        store_write_attempts: NonZeroU32::MIN,
        queue_capacity: 0,
        queue_full_policy: QueueFullPolicy::Block,
        dedupe_in_flight: false,
    }
}

fn host_settings() -> HostSettings {
    HostSettings {
        key: ArtifactKey::parse(HOST).expect("valid key"),
        notification_pattern: keyspace_pattern(HOST),
        resubscribe_delay: Duration::from_secs(5),
    }
}

async fn next_stored(outcomes: &mut broadcast::Receiver<JobOutcome>) -> ArtifactKey {
    match outcomes.recv().await.expect("job outcome") {
        JobOutcome::Stored { key, .. } => key,
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn host_artifact_heals_after_expiry() {
    let store = Arc::new(MemoryStore::new(Duration::from_millis(500)));
    let (pool, queue) = WorkerPool::start(
        pool_config(Duration::ZERO),
        store.clone(),
        Arc::new(PrefixGenerator::new("foo")),
    );
    let mut outcomes = pool.subscribe_outcomes();
    let watcher = ExpirationWatcher::new(store.clone(), queue.clone(), &host_settings())
        .spawn(pool.shutdown_signal());
    tokio::task::yield_now().await;

    let host = ArtifactKey::parse(HOST).expect("valid key");
    queue
        .submit(GenerationRequest::new(host.clone()), JobSource::Startup)
        .await
        .expect("cold start accepted");
    assert_eq!(next_stored(&mut outcomes).await, host);

    assert!(store.expire(HOST));
    assert!(store.get(&host).await.expect("get succeeds").is_none());

    assert_eq!(next_stored(&mut outcomes).await, host);
    let healed = store
        .get(&host)
        .await
        .expect("get succeeds")
        .expect("host regenerated");
    assert_eq!(healed.value, "foo-example.com");

    pool.shutdown(Duration::from_secs(1)).await;
    watcher.await.expect("watcher task");
}

#[tokio::test(start_paused = true)]
async fn ttl_elapsed_turns_hit_into_miss() {
    let store = Arc::new(MemoryStore::new(Duration::from_secs(1)));
    let mut config = pool_config(Duration::ZERO);
    config.ttl = Duration::from_secs(30);
    let (pool, queue) = WorkerPool::start(
        config,
        store.clone(),
        Arc::new(PrefixGenerator::new("foo")),
    );
    let mut outcomes = pool.subscribe_outcomes();
    let gateway = CacheGateway::new(store.clone(), queue);
    let key = ArtifactKey::parse("example.org").expect("valid key");

    gateway.request(key.clone()).await.expect("accepted");
    next_stored(&mut outcomes).await;
    assert!(matches!(gateway.lookup(&key).await, Lookup::Hit(_)));

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(matches!(gateway.lookup(&key).await, Lookup::Hit(_)));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(gateway.lookup(&key).await, Lookup::Miss);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn single_worker_with_pause_delays_second_request() {
    let store: Arc<dyn ArtifactStore> = Arc::new(MemoryStore::new(Duration::from_secs(60)));
    let (pool, queue) = WorkerPool::start(
        pool_config(Duration::from_secs(10)),
        store.clone(),
        Arc::new(PrefixGenerator::new("foo")),
    );
    let app = build_router(HttpState {
        gateway: Arc::new(CacheGateway::new(store.clone(), queue)),
        store,
        retry_after: Duration::from_secs(10),
    });
    let request = |uri: &str| {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request should build")
    };

    let started = Instant::now();
    let first = app
        .clone()
        .oneshot(request("/artifact/a.example.org"))
        .await
        .expect("router should respond");
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert!(started.elapsed() < Duration::from_secs(1));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = app
        .clone()
        .oneshot(request("/artifact/b.example.org"))
        .await
        .expect("router should respond");
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(11));

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn each_expiration_regenerates_host_exactly_once() {
    let store = Arc::new(MemoryStore::new(Duration::from_millis(100)));
    let mut config = pool_config(Duration::ZERO);
    config.ttl = Duration::from_secs(5);
    config.workers = NonZeroU32::new(4).expect("non-zero");
    let (pool, queue) = WorkerPool::start(
        config,
        store.clone(),
        Arc::new(PrefixGenerator::new("foo")),
    );
    let mut outcomes = pool.subscribe_outcomes();
    let watcher = ExpirationWatcher::new(store.clone(), queue.clone(), &host_settings())
        .spawn(pool.shutdown_signal());
    tokio::task::yield_now().await;

    let host = ArtifactKey::parse(HOST).expect("valid key");
    queue
        .submit(GenerationRequest::new(host.clone()), JobSource::Startup)
        .await
        .expect("cold start accepted");

    // Cold start plus one regeneration per 5s expiry.
    for _ in 0..4 {
        assert_eq!(next_stored(&mut outcomes).await, host);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(outcomes.try_recv().is_err());

    pool.shutdown(Duration::from_secs(1)).await;
    watcher.await.expect("watcher task");
}
