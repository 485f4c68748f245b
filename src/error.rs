//! Error types for the TTL controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource discovery error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The informer cache for a kind never completed its initial sync
    #[error("cache sync failed for {0}")]
    CacheSync(String),

    /// A work key that is not of the form `namespace/name` or `name`
    #[error("malformed work key {0:?}")]
    MalformedKey(String),
}

impl Error {
    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a cache-sync error naming the kind that failed
    pub fn cache_sync(kind: impl ToString) -> Self {
        Self::CacheSync(kind.to_string())
    }

    /// Whether a reconcile failure with this error is permanent.
    ///
    /// Permanent failures are logged and dropped; anything else is retried
    /// with rate-limited backoff.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::MalformedKey(_))
    }
}
