//! Artifact store capability.
//!
//! The core only needs a TTL-capable key-value store that can stream
//! keyspace expiration notifications:
//!
//! - [`MemoryStore`]: in-process store, used when no `store.url` is configured
//! - [`RedisStore`]: Redis with keyspace notifications (`notify-keyspace-events Ex`)

mod lock;
mod memory;
pub mod pattern;
mod redis_store;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tracing::info;

use crate::{
    config::StoreSettings,
    domain::types::{Artifact, ArtifactKey},
};

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection failed: {message}")]
    Connection { message: String },
    #[error("store command `{command}` failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
    #[error("notification stream lagged, {skipped} notifications dropped")]
    Lagged { skipped: u64 },
    #[error("malformed notification on channel `{channel}`")]
    MalformedNotification { channel: String },
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn command(command: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            command,
            message: message.into(),
        }
    }
}

/// A key that the store evicted because its TTL elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationEvent {
    pub key: String,
}

/// Stream of expiration notifications. Items are receive results; the stream
/// ends when the underlying subscription terminates.
pub type ExpirationStream = BoxStream<'static, Result<ExpirationEvent, StoreError>>;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read a stored artifact. `Ok(None)` means not found (never generated or expired).
    async fn get(&self, key: &ArtifactKey) -> Result<Option<Artifact>, StoreError>;

    /// Write `value` under `key`, replacing any previous value and TTL.
    async fn set(&self, key: &ArtifactKey, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Subscribe to expiration notifications whose keyspace channel matches `pattern`.
    async fn subscribe(&self, pattern: &str) -> Result<ExpirationStream, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Connect the store selected by `settings`.
pub async fn connect(settings: &StoreSettings) -> Result<Arc<dyn ArtifactStore>, StoreError> {
    match settings.url.as_deref() {
        Some(url) => {
            let store = RedisStore::connect(url, settings.configure_notifications).await?;
            info!(
                target = "certcache::store",
                backend = "redis",
                "artifact store connected"
            );
            Ok(Arc::new(store))
        }
        None => {
            let store = MemoryStore::new(settings.reap_interval);
            info!(
                target = "certcache::store",
                backend = "memory",
                reap_interval_ms = settings.reap_interval.as_millis() as u64,
                "artifact store ready"
            );
            Ok(Arc::new(store))
        }
    }
}
