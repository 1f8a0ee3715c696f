//! Cache of the last status observed from the provider.
//!
//! The reconciler records every `describe_status` answer here, so status
//! queries from the API can show what the provider last said without another
//! control-plane round trip.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::ProviderStatus;

/// A provider status together with when it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    /// The reported status.
    pub status: ProviderStatus,
    /// When the daemon saw it.
    pub observed_at: DateTime<Utc>,
}

/// A cache of provider statuses keyed by provider id.
#[derive(Debug, Default)]
pub struct StatusCache {
    cache: RwLock<HashMap<String, Observed>>,
}

impl StatusCache {
    /// Create a new empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the last observed status for a provider id.
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<Observed> {
        self.cache.read().get(provider_id).cloned()
    }

    /// Record an observation, replacing any older one.
    pub fn record(&self, provider_id: &str, status: ProviderStatus, observed_at: DateTime<Utc>) {
        self.cache.write().insert(
            provider_id.to_string(),
            Observed {
                status,
                observed_at,
            },
        );
    }

    /// Remove an entry, typically once the resource is terminated.
    pub fn remove(&self, provider_id: &str) -> Option<Observed> {
        self.cache.write().remove(provider_id)
    }

    /// Get the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}
