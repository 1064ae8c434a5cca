use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::domain::types::ArtifactKey;

/// Keys that currently have a queued or running generation job.
#[derive(Clone, Default)]
pub struct InFlightKeys {
    keys: Arc<DashMap<ArtifactKey, ()>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InFlightError {
    #[error("generation already queued for `{key}`")]
    AlreadyQueued { key: ArtifactKey },
}

impl InFlightKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &ArtifactKey) -> Result<InFlightGuard, InFlightError> {
        use dashmap::mapref::entry::Entry;

        match self.keys.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(InFlightGuard {
                    key: key.clone(),
                    keys: Arc::clone(&self.keys),
                })
            }
            Entry::Occupied(_) => Err(InFlightError::AlreadyQueued { key: key.clone() }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Releases its key when dropped, whether the job finished, failed, or was discarded.
pub struct InFlightGuard {
    key: ArtifactKey,
    keys: Arc<DashMap<ArtifactKey, ()>>,
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InFlightGuard").field(&self.key).finish()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
