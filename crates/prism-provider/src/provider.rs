//! The provider control-plane trait.

use std::fmt;

use async_trait::async_trait;
use prism_store::ProviderState;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::ProviderStatus;

/// A mutating call against the provider control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAction {
    /// Start a stopped instance.
    Start,
    /// Stop a running instance.
    Stop,
    /// Hibernate a running instance (memory to disk).
    Hibernate,
    /// Resume a hibernated instance.
    Resume,
    /// Terminate the instance permanently.
    Terminate,
}

impl ProviderAction {
    /// Path segment used by the HTTP adapter.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Hibernate => "hibernate",
            Self::Resume => "resume",
            Self::Terminate => "terminate",
        }
    }

    /// The provider state the instance settles in once the action completes.
    #[must_use]
    pub const fn settled_state(self) -> ProviderState {
        match self {
            Self::Start | Self::Resume => ProviderState::Running,
            Self::Stop => ProviderState::Stopped,
            Self::Hibernate => ProviderState::Hibernated,
            Self::Terminate => ProviderState::Terminated,
        }
    }
}

impl fmt::Display for ProviderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for the cloud provider's control plane.
///
/// Every mutating call returns the status the provider reports once it has
/// accepted the call. A start or resume may come back as `Pending`; the
/// reconciler confirms the final state later.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Start an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or fails the call.
    async fn start(&self, provider_id: &str) -> Result<ProviderStatus>;

    /// Stop an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or fails the call.
    async fn stop(&self, provider_id: &str) -> Result<ProviderStatus>;

    /// Hibernate an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or fails the call.
    async fn hibernate(&self, provider_id: &str) -> Result<ProviderStatus>;

    /// Resume a hibernated instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or fails the call.
    async fn resume(&self, provider_id: &str) -> Result<ProviderStatus>;

    /// Terminate an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects or fails the call.
    async fn terminate(&self, provider_id: &str) -> Result<ProviderStatus>;

    /// Describe the current provider-side status.
    ///
    /// An id the provider does not know yields a `NotFound` state, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be queried.
    async fn describe_status(&self, provider_id: &str) -> Result<ProviderStatus>;

    /// Dispatch a [`ProviderAction`] to the matching call.
    ///
    /// # Errors
    ///
    /// Returns whatever the underlying call returns.
    async fn apply(&self, action: ProviderAction, provider_id: &str) -> Result<ProviderStatus> {
        match action {
            ProviderAction::Start => self.start(provider_id).await,
            ProviderAction::Stop => self.stop(provider_id).await,
            ProviderAction::Hibernate => self.hibernate(provider_id).await,
            ProviderAction::Resume => self.resume(provider_id).await,
            ProviderAction::Terminate => self.terminate(provider_id).await,
        }
    }
}
