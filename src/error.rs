//! Error types for the caching engine

use thiserror::Error;

/// Result type alias for the caching engine
pub type Result<T> = std::result::Result<T, Error>;

/// Caching engine errors
///
/// Only [`Error::NotIdempotent`], [`Error::Factory`], and [`Error::Cancelled`]
/// ever reach a caller of `get_or_create`. Layer and configuration failures are
/// logged and recovered locally (reads miss, writes are retried or dropped).
///
/// The enum is `Clone` so a single factory failure can be delivered to every
/// caller awaiting the same single-flight execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Call site did not assert idempotency but the resolved policy requires it
    #[error("Method not asserted idempotent: {0}")]
    NotIdempotent(String),

    /// User-supplied factory failed; never cached
    #[error("Factory failed for '{method}': {message}")]
    Factory {
        /// Method identity the factory was invoked for
        method: String,
        /// Rendered error chain from the factory
        message: String,
    },

    /// Transient failure in a cache layer or the backplane
    #[error("Transient failure in layer '{layer}': {message}")]
    LayerTransient {
        /// Layer name
        layer: String,
        /// Failure detail
        message: String,
    },

    /// A layer is permanently unreachable (surfaced via health, not to callers)
    #[error("Layer '{layer}' unreachable: {message}")]
    LayerFatal {
        /// Layer name
        layer: String,
        /// Failure detail
        message: String,
    },

    /// Caller's cancellation signal fired
    #[error("Operation cancelled")]
    Cancelled,

    /// A policy source produced unparsable content
    #[error("Invalid configuration from '{origin}': {detail}")]
    ConfigurationInvalid {
        /// Source name
        origin: String,
        /// Parse or validation detail
        detail: String,
    },
}

impl Error {
    /// Create a [`Error::Factory`] from an `anyhow` error chain
    pub fn factory(method: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Factory {
            method: method.into(),
            message: format!("{err:#}"),
        }
    }

    /// Create a [`Error::LayerTransient`]
    pub fn transient(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LayerTransient {
            layer: layer.into(),
            message: message.into(),
        }
    }

    /// Create a [`Error::ConfigurationInvalid`]
    pub fn config(source: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            origin: source.into(),
            detail: detail.into(),
        }
    }

    /// Whether a retry of the failed operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LayerTransient { .. })
    }
}
