//! In-memory provider for tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prism_store::ProviderState;
use tokio::sync::watch;

use crate::error::{ProviderError, Result};
use crate::provider::{Provider, ProviderAction};
use crate::types::ProviderStatus;

/// A mock provider that keeps instance states in memory.
///
/// Supports scripted failures, a pending start mode, external drift via
/// [`MockProvider::set_state`], and a gate that holds mutating calls open so
/// tests can observe in-flight transitions.
pub struct MockProvider {
    instances: Mutex<HashMap<String, ProviderStatus>>,
    failures: Mutex<HashMap<ProviderAction, VecDeque<ProviderError>>>,
    describe_failures: Mutex<VecDeque<ProviderError>>,
    calls: Mutex<Vec<(ProviderAction, String)>>,
    describe_calls: Mutex<u32>,
    start_pending: Mutex<bool>,
    gate: watch::Sender<bool>,
}

impl Default for MockProvider {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            instances: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            describe_failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            describe_calls: Mutex::new(0),
            start_pending: Mutex::new(false),
            gate,
        }
    }
}

impl MockProvider {
    /// Create a new mock provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance in a given state.
    pub fn insert(&self, provider_id: &str, state: ProviderState) {
        self.instances
            .lock()
            .insert(provider_id.to_string(), ProviderStatus::new(state));
    }

    /// Change an instance's state as if done outside the daemon.
    pub fn set_state(
        &self,
        provider_id: &str,
        state: ProviderState,
        changed_at: Option<DateTime<Utc>>,
    ) {
        let mut status = ProviderStatus::new(state);
        status.changed_at = changed_at;
        self.instances.lock().insert(provider_id.to_string(), status);
    }

    /// Remove an instance entirely.
    pub fn forget(&self, provider_id: &str) {
        self.instances.lock().remove(provider_id);
    }

    /// Current state of an instance, if known.
    #[must_use]
    pub fn state_of(&self, provider_id: &str) -> Option<ProviderState> {
        self.instances.lock().get(provider_id).map(|s| s.state)
    }

    /// Queue an error for the next call of `action`.
    pub fn fail_next(&self, action: ProviderAction, error: ProviderError) {
        self.failures
            .lock()
            .entry(action)
            .or_default()
            .push_back(error);
    }

    /// Queue the same error for the next `times` calls of `action`.
    pub fn fail_times(&self, action: ProviderAction, error: &ProviderError, times: usize) {
        for _ in 0..times {
            self.fail_next(action, error.clone());
        }
    }

    /// Queue the same error for the next `times` describe calls.
    pub fn fail_describe_times(&self, error: &ProviderError, times: usize) {
        let mut queue = self.describe_failures.lock();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Make `start` report `Pending` instead of `Running`.
    pub fn set_start_pending(&self, pending: bool) {
        *self.start_pending.lock() = pending;
    }

    /// Hold every mutating call until [`MockProvider::release`] is called.
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Let held calls proceed.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Number of mutating calls made for `action`.
    #[must_use]
    pub fn call_count(&self, action: ProviderAction) -> usize {
        self.calls.lock().iter().filter(|(a, _)| *a == action).count()
    }

    /// Every mutating call made, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(ProviderAction, String)> {
        self.calls.lock().clone()
    }

    /// Number of `describe_status` calls made.
    #[must_use]
    pub fn describe_count(&self) -> u32 {
        *self.describe_calls.lock()
    }

    async fn perform(&self, action: ProviderAction, provider_id: &str) -> Result<ProviderStatus> {
        self.calls.lock().push((action, provider_id.to_string()));

        let mut gate = self.gate.subscribe();
        // Sender is owned by self, so wait_for cannot observe a closed channel.
        let _ = gate.wait_for(|open| *open).await;

        let scripted = self
            .failures
            .lock()
            .get_mut(&action)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        let mut instances = self.instances.lock();
        if action != ProviderAction::Start && !instances.contains_key(provider_id) {
            return Err(ProviderError::NotFound(provider_id.to_string()));
        }

        let state = if action == ProviderAction::Start && *self.start_pending.lock() {
            ProviderState::Pending
        } else {
            action.settled_state()
        };
        let status = ProviderStatus {
            state,
            changed_at: Some(Utc::now()),
            message: None,
        };
        instances.insert(provider_id.to_string(), status.clone());
        Ok(status)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn start(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.perform(ProviderAction::Start, provider_id).await
    }

    async fn stop(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.perform(ProviderAction::Stop, provider_id).await
    }

    async fn hibernate(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.perform(ProviderAction::Hibernate, provider_id).await
    }

    async fn resume(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.perform(ProviderAction::Resume, provider_id).await
    }

    async fn terminate(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.perform(ProviderAction::Terminate, provider_id).await
    }

    async fn describe_status(&self, provider_id: &str) -> Result<ProviderStatus> {
        *self.describe_calls.lock() += 1;
        if let Some(err) = self.describe_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self
            .instances
            .lock()
            .get(provider_id)
            .cloned()
            .unwrap_or_else(|| ProviderStatus::new(ProviderState::NotFound)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn start_then_hibernate() {
        let provider = MockProvider::new();

        let status = provider.start("i-1").await.unwrap();
        assert_eq!(status.state, ProviderState::Running);

        provider.hibernate("i-1").await.unwrap();
        assert_eq!(provider.state_of("i-1"), Some(ProviderState::Hibernated));
        assert_eq!(provider.call_count(ProviderAction::Hibernate), 1);
    }

    #[tokio::test]
    async fn unknown_instance() {
        let provider = MockProvider::new();
        assert!(matches!(
            provider.stop("i-x").await,
            Err(ProviderError::NotFound(_))
        ));
        let status = provider.describe_status("i-x").await.unwrap();
        assert_eq!(status.state, ProviderState::NotFound);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let provider = MockProvider::new();
        provider.insert("i-1", ProviderState::Running);
        provider.fail_times(
            ProviderAction::Stop,
            &ProviderError::Transient("busy".into()),
            2,
        );

        assert!(provider.stop("i-1").await.is_err());
        assert!(provider.stop("i-1").await.is_err());
        assert!(provider.stop("i-1").await.is_ok());
        assert_eq!(provider.call_count(ProviderAction::Stop), 3);
    }

    #[tokio::test]
    async fn pending_start() {
        let provider = MockProvider::new();
        provider.set_start_pending(true);
        let status = provider.start("i-1").await.unwrap();
        assert_eq!(status.state, ProviderState::Pending);
    }

    #[tokio::test]
    async fn held_calls_wait_for_release() {
        let provider = Arc::new(MockProvider::new());
        provider.insert("i-1", ProviderState::Running);
        provider.hold();

        let p = Arc::clone(&provider);
        let call = tokio::spawn(async move { p.stop("i-1").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!call.is_finished());
        assert_eq!(provider.state_of("i-1"), Some(ProviderState::Running));

        provider.release();
        let status = call.await.unwrap().unwrap();
        assert_eq!(status.state, ProviderState::Stopped);
    }
}
