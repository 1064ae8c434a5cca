//! Artifact generation.
//!
//! Generation is pure with respect to the store: the generator produces a
//! value and the job runner persists it.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::types::ArtifactKey;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation failed: {0}")]
    Failed(String),
    #[error("generation panicked: {0}")]
    Panicked(String),
}

impl GenerationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, key: &ArtifactKey) -> Result<String, GenerationError>;
}

/// Produces `<prefix>-<key>`.
#[derive(Debug, Clone)]
pub struct PrefixGenerator {
    prefix: String,
}

impl PrefixGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ArtifactGenerator for PrefixGenerator {
    async fn generate(&self, key: &ArtifactKey) -> Result<String, GenerationError> {
        Ok(format!("{}-{}", self.prefix, key))
    }
}
