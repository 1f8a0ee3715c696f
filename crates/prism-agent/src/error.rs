//! Error types for the idle detection agent.

use thiserror::Error;

/// Errors raised by the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Required configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A system activity source could not be read or parsed.
    #[error("sampling failed: {0}")]
    Sampling(String),

    /// Reading or writing local state failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local state could not be encoded or decoded.
    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The daemon or update server could not be reached.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with an error status.
    #[error("daemon rejected heartbeat ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// A downloaded artifact failed verification.
    #[error("update verification failed: {0}")]
    Verification(String),
}

impl AgentError {
    /// Whether the failure is worth retrying on the next tick.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::Io(_) | Self::Sampling(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Config(_) | Self::Encoding(_) | Self::Verification(_) => false,
        }
    }
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
