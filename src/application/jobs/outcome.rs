use std::time::Duration;

use crate::domain::types::ArtifactKey;

/// What happened to one generation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Stored {
        key: ArtifactKey,
        attempts: u32,
        elapsed: Duration,
    },
    GenerationFailed {
        key: ArtifactKey,
        reason: String,
    },
    StoreFailed {
        key: ArtifactKey,
        attempts: u32,
        reason: String,
    },
}

impl JobOutcome {
    pub fn key(&self) -> &ArtifactKey {
        match self {
            JobOutcome::Stored { key, .. }
            | JobOutcome::GenerationFailed { key, .. }
            | JobOutcome::StoreFailed { key, .. } => key,
        }
    }

    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Stored { .. } => "stored",
            JobOutcome::GenerationFailed { .. } => "generation_failed",
            JobOutcome::StoreFailed { .. } => "store_failed",
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, JobOutcome::Stored { .. })
    }
}
