//! Common error types for prism.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by core value types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A budget period string could not be parsed.
    #[error("invalid budget period: {0}")]
    InvalidPeriod(String),

    /// An idle scoring profile is unusable.
    #[error("invalid scoring profile: {0}")]
    InvalidScoring(String),
}
