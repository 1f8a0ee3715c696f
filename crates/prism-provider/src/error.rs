//! Error types for the provider crate.

use thiserror::Error;

/// Errors returned by provider control-plane calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Throttling, 5xx or connectivity trouble; worth retrying.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider rejected the call outright.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The provider has no record of this id.
    #[error("provider resource not found: {0}")]
    NotFound(String),

    /// The call did not complete within its deadline.
    #[error("provider call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Check if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// A specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
