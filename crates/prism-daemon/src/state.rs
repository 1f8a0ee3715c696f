//! Daemon application state.
//!
//! This module defines the shared state that is available to all request handlers.

use std::sync::Arc;

use prism_engine::Governance;

use crate::config::DaemonConfig;

/// Shared application state for the daemon.
pub struct DaemonState<G>
where
    G: Governance,
{
    /// The governance engine behind every endpoint.
    pub governance: Arc<G>,
    /// Daemon configuration.
    pub config: DaemonConfig,
}

impl<G> DaemonState<G>
where
    G: Governance,
{
    /// Create a new daemon state.
    #[must_use]
    pub fn new(governance: Arc<G>, config: DaemonConfig) -> Self {
        Self { governance, config }
    }
}

impl<G> Clone for DaemonState<G>
where
    G: Governance,
{
    fn clone(&self) -> Self {
        Self {
            governance: Arc::clone(&self.governance),
            config: self.config.clone(),
        }
    }
}
