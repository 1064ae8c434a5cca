use std::{any::Any, num::NonZeroU32, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use metrics::histogram;
use tokio::time::Instant;
use tracing::warn;

use crate::{
    application::generator::{ArtifactGenerator, GenerationError},
    domain::types::ArtifactKey,
    store::{ArtifactStore, StoreError},
};

use super::outcome::JobOutcome;

/// Generates one artifact and writes it to the store with the configured TTL.
///
/// Shared by the worker pool and the one-shot `generate` command so both paths
/// produce identical store contents.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn ArtifactStore>,
    generator: Arc<dyn ArtifactGenerator>,
    ttl: Duration,
    store_write_attempts: NonZeroU32,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn ArtifactGenerator>,
        ttl: Duration,
        store_write_attempts: NonZeroU32,
    ) -> Self {
        Self {
            store,
            generator,
            ttl,
            store_write_attempts,
        }
    }

    pub async fn run(&self, key: &ArtifactKey) -> JobOutcome {
        let started = Instant::now();

        let value = match self.generate(key).await {
            Ok(value) => value,
            Err(err) => {
                return JobOutcome::GenerationFailed {
                    key: key.clone(),
                    reason: err.to_string(),
                };
            }
        };
        histogram!("certcache_generation_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        let max_attempts = self.store_write_attempts.get();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write(key, &value).await {
                Ok(()) => {
                    return JobOutcome::Stored {
                        key: key.clone(),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) if attempt < max_attempts => {
                    warn!(
                        target = "certcache::jobs",
                        key = %key,
                        attempt,
                        max_attempts,
                        error = %err,
                        "store write failed, retrying"
                    );
                }
                Err(err) => {
                    return JobOutcome::StoreFailed {
                        key: key.clone(),
                        attempts: attempt,
                        reason: err.to_string(),
                    };
                }
            }
        }
    }

    /// Run the generator, turning a panic into an error so the worker survives.
    async fn generate(&self, key: &ArtifactKey) -> Result<String, GenerationError> {
        match AssertUnwindSafe(self.generator.generate(key))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(GenerationError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    /// A panicking store write counts as a failed attempt.
    async fn write(&self, key: &ArtifactKey, value: &str) -> Result<(), StoreError> {
        match AssertUnwindSafe(self.store.set(key, value, self.ttl))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(StoreError::command(
                "SET",
                format!("store panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
