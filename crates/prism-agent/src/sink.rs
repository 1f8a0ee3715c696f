//! Heartbeat delivery to the daemon.

use async_trait::async_trait;
use prism_core::IdleSignal;
use serde::Deserialize;

use crate::error::{AgentError, Result};

/// The daemon's answer to a heartbeat.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatReply {
    /// Whether the signal was accepted.
    pub accepted: bool,
    /// Why it was ignored, when it was.
    #[serde(default)]
    pub reason: Option<String>,
    /// Seconds of continuous idleness the daemon has accumulated.
    #[serde(default)]
    pub idle_for_secs: u64,
}

/// Destination for heartbeats.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    /// Deliver one heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the heartbeat could not be delivered.
    async fn send(&self, signal: &IdleSignal) -> Result<HeartbeatReply>;
}

/// Posts heartbeats to `POST {daemon}/v1/heartbeats`.
#[derive(Debug, Clone)]
pub struct HttpHeartbeatSink {
    client: reqwest::Client,
    url: String,
}

impl HttpHeartbeatSink {
    /// Create a sink for the daemon at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a sink with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/v1/heartbeats", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl HeartbeatSink for HttpHeartbeatSink {
    async fn send(&self, signal: &IdleSignal) -> Result<HeartbeatReply> {
        let response = self.client.post(&self.url).json(signal).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}
