//! Artifact keys, generation requests and cached artifacts.

use std::fmt;

use time::OffsetDateTime;

use super::error::DomainError;

/// Longest key accepted; matches the maximum length of a DNS name.
pub const MAX_KEY_LEN: usize = 253;

/// Validated name of a cached artifact (a domain name for certificates).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(DomainError::invalid_key(raw, "key must not be empty"));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(DomainError::invalid_key(raw, "key exceeds 253 bytes"));
        }
        if raw.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
            return Err(DomainError::invalid_key(
                raw,
                "key must not contain whitespace or control characters",
            ));
        }
        if raw.contains('/') {
            return Err(DomainError::invalid_key(raw, "key must not contain `/`"));
        }

        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to (re)generate one artifact. Consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub key: ArtifactKey,
}

impl GenerationRequest {
    pub fn new(key: ArtifactKey) -> Self {
        Self { key }
    }
}

/// A cached artifact as read back from the store.
///
/// Presence in the store is the only validity signal; `expires_at` is
/// informational and `None` when the store cannot report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: ArtifactKey,
    pub value: String,
    pub expires_at: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_domain_names() {
        let key = ArtifactKey::parse("www.example.com").expect("valid key");
        assert_eq!(key.as_str(), "www.example.com");
        assert_eq!(key.to_string(), "www.example.com");
    }

    #[test]
    fn rejects_empty_key() {
        assert!(matches!(
            ArtifactKey::parse(""),
            Err(DomainError::InvalidKey { .. })
        ));
    }

    #[test]
    fn rejects_whitespace_and_slashes() {
        assert!(ArtifactKey::parse("exa mple.com").is_err());
        assert!(ArtifactKey::parse("example.com\n").is_err());
        assert!(ArtifactKey::parse("a/b").is_err());
    }

    #[test]
    fn rejects_overlong_key() {
        let raw = "a".repeat(MAX_KEY_LEN + 1);
        assert!(ArtifactKey::parse(raw).is_err());
        assert!(ArtifactKey::parse("a".repeat(MAX_KEY_LEN)).is_ok());
    }
}
