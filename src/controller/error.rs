//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::redis::RedisError;
use crate::redis::sharded::DiscoveryErrors;
use crate::threads::ThreadError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Redis or Sentinel command error
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    /// Fatal discovery failure
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryErrors),

    /// Background task could not be started
    #[error("Background task error: {0}")]
    Thread(#[from] ThreadError),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            // Sentinel and Redis failures are expected to be transient.
            Error::Redis(RedisError::InvalidConnectionString { .. }) => false,
            Error::Redis(_) | Error::Discovery(_) | Error::Thread(_) => true,
            Error::Validation(_) | Error::MissingField(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            Error::Redis(_) | Error::Discovery(_) => Duration::from_secs(10),
            _ if self.is_retryable() => Duration::from_secs(30),
            _ => Duration::from_secs(300),
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
