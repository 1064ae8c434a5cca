//! In-process artifact store with TTL eviction and keyspace notifications.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use time::OffsetDateTime;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::domain::types::{Artifact, ArtifactKey};

use super::{
    ArtifactStore, ExpirationEvent, ExpirationStream, StoreError,
    lock::{rw_read, rw_write},
    pattern::{glob_match, keyspace_channel},
};

const SOURCE: &str = "store::memory";
const NOTIFICATION_CAPACITY: usize = 256;
/// Database index reported in keyspace channels; the in-process store has one.
const DB_INDEX: u32 = 0;

struct Entry {
    value: String,
    deadline: Instant,
    expires_at: Option<OffsetDateTime>,
}

struct Shared {
    entries: RwLock<HashMap<String, Entry>>,
    expirations: broadcast::Sender<String>,
}

impl Shared {
    /// Remove `key` if its deadline has passed and announce the expiration.
    fn expire_if_due(&self, key: &str, now: Instant) -> bool {
        let removed = {
            let mut entries = rw_write(&self.entries, SOURCE, "expire_if_due");
            match entries.get(key) {
                Some(entry) if entry.deadline <= now => entries.remove(key).is_some(),
                _ => false,
            }
        };

        if removed {
            self.announce(key.to_string());
        }
        removed
    }

    fn reap(&self, now: Instant) -> usize {
        let expired: Vec<String> = {
            let mut entries = rw_write(&self.entries, SOURCE, "reap");
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        let count = expired.len();
        for key in expired {
            self.announce(key);
        }
        count
    }

    fn announce(&self, key: String) {
        counter!("certcache_store_expired_total").increment(1);
        debug!(target = "certcache::store", key = %key, "artifact expired");
        // No receivers simply means nobody is watching.
        let _ = self.expirations.send(key);
    }
}

/// Artifact store kept in process memory.
///
/// Expired entries disappear lazily on read and eagerly via a reaper task that
/// runs every `reap_interval`. Each removal is published as a keyspace
/// expiration notification on channel `__keyspace@0__:<key>`.
pub struct MemoryStore {
    shared: Arc<Shared>,
    reaper: JoinHandle<()>,
}

impl MemoryStore {
    /// Create the store and spawn its reaper. Must be called inside a tokio runtime.
    pub fn new(reap_interval: Duration) -> Self {
        let (expirations, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let shared = Arc::new(Shared {
            entries: RwLock::new(HashMap::new()),
            expirations,
        });
        let reaper = tokio::spawn(reap_loop(Arc::downgrade(&shared), reap_interval));

        Self { shared, reaper }
    }

    /// Expire `key` immediately, as if its TTL had elapsed. Returns whether it existed.
    pub fn expire(&self, key: &str) -> bool {
        let removed = rw_write(&self.shared.entries, SOURCE, "expire")
            .remove(key)
            .is_some();
        if removed {
            self.shared.announce(key.to_string());
        }
        removed
    }

    /// Number of live entries, counting ones past their deadline that are not yet reaped.
    pub fn len(&self) -> usize {
        rw_read(&self.shared.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

async fn reap_loop(shared: Weak<Shared>, reap_interval: Duration) {
    let mut interval = tokio::time::interval(reap_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.reap(Instant::now());
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn get(&self, key: &ArtifactKey) -> Result<Option<Artifact>, StoreError> {
        let now = Instant::now();
        {
            let entries = rw_read(&self.shared.entries, SOURCE, "get");
            match entries.get(key.as_str()) {
                None => return Ok(None),
                Some(entry) if entry.deadline > now => {
                    return Ok(Some(Artifact {
                        key: key.clone(),
                        value: entry.value.clone(),
                        expires_at: entry.expires_at,
                    }));
                }
                Some(_) => {}
            }
        }

        self.shared.expire_if_due(key.as_str(), now);
        Ok(None)
    }

    async fn set(&self, key: &ArtifactKey, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now()
            .checked_add(ttl)
            .filter(|_| !ttl.is_zero())
            .ok_or_else(|| StoreError::command("SET", "invalid expire time"))?;

        let entry = Entry {
            value: value.to_string(),
            deadline,
            expires_at: time::Duration::try_from(ttl)
                .ok()
                .and_then(|ttl| OffsetDateTime::now_utc().checked_add(ttl)),
        };
        rw_write(&self.shared.entries, SOURCE, "set").insert(key.as_str().to_string(), entry);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<ExpirationStream, StoreError> {
        let receiver = self.shared.expirations.subscribe();
        let pattern = pattern.to_string();

        let stream = futures::stream::unfold(
            (receiver, pattern),
            |(mut receiver, pattern)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(key) => {
                            if glob_match(&pattern, &keyspace_channel(DB_INDEX, &key)) {
                                return Some((Ok(ExpirationEvent { key }), (receiver, pattern)));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            return Some((
                                Err(StoreError::Lagged { skipped }),
                                (receiver, pattern),
                            ));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::store::pattern::keyspace_pattern;

    fn key(raw: &str) -> ArtifactKey {
        ArtifactKey::parse(raw).expect("valid key")
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_until_ttl_elapses() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let domain = key("example.org");

        store
            .set(&domain, "foo-example.org", Duration::from_secs(10))
            .await
            .expect("set succeeds");

        let hit = store.get(&domain).await.expect("get succeeds");
        let artifact = hit.expect("artifact present");
        assert_eq!(artifact.value, "foo-example.org");
        assert!(artifact.expires_at.is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get(&domain).await.expect("get succeeds").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_value_and_ttl() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let domain = key("example.org");

        store
            .set(&domain, "first", Duration::from_secs(5))
            .await
            .expect("set succeeds");
        tokio::time::advance(Duration::from_secs(4)).await;
        store
            .set(&domain, "second", Duration::from_secs(5))
            .await
            .expect("set succeeds");
        tokio::time::advance(Duration::from_secs(4)).await;

        let artifact = store
            .get(&domain)
            .await
            .expect("get succeeds")
            .expect("artifact present");
        assert_eq!(artifact.value, "second");
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let result = store.set(&key("example.org"), "v", Duration::ZERO).await;
        assert!(matches!(result, Err(StoreError::Command { .. })));
    }

    #[tokio::test]
    async fn unrepresentable_ttl_is_rejected() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let result = store.set(&key("example.org"), "v", Duration::MAX).await;
        assert!(matches!(result, Err(StoreError::Command { command: "SET", .. })));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_publishes_matching_expirations() {
        let store = MemoryStore::new(Duration::from_millis(100));
        let mut events = store
            .subscribe(&keyspace_pattern("example.com"))
            .await
            .expect("subscribe succeeds");

        store
            .set(&key("other.com"), "v", Duration::from_secs(1))
            .await
            .expect("set succeeds");
        store
            .set(&key("example.com"), "v", Duration::from_secs(2))
            .await
            .expect("set succeeds");

        let event = events
            .next()
            .await
            .expect("stream open")
            .expect("event received");
        assert_eq!(event.key, "example.com");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn manual_expire_notifies_subscribers() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let mut events = store
            .subscribe(&keyspace_pattern("example.com"))
            .await
            .expect("subscribe succeeds");

        store
            .set(&key("example.com"), "v", Duration::from_secs(600))
            .await
            .expect("set succeeds");
        assert!(store.expire("example.com"));
        assert!(!store.expire("example.com"));

        let event = events
            .next()
            .await
            .expect("stream open")
            .expect("event received");
        assert_eq!(event.key, "example.com");
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_receive_error() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let mut events = store.subscribe("*").await.expect("subscribe succeeds");

        for idx in 0..(NOTIFICATION_CAPACITY + 8) {
            let domain = key(&format!("host-{idx}.example.com"));
            store
                .set(&domain, "v", Duration::from_secs(600))
                .await
                .expect("set succeeds");
            store.expire(domain.as_str());
        }

        let first = events.next().await.expect("stream open");
        assert!(matches!(first, Err(StoreError::Lagged { .. })));
        let next = events.next().await.expect("stream open");
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn store_recovers_from_poisoned_lock() {
        let store = MemoryStore::new(Duration::from_secs(60));

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .shared
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        store
            .set(&key("example.org"), "v", Duration::from_secs(60))
            .await
            .expect("set succeeds");
        assert_eq!(store.len(), 1);
    }
}
