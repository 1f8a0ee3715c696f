//! HTTP client for a provider adapter service.
//!
//! The adapter exposes a small REST surface in front of the real cloud API:
//!
//! - `POST {base}/v1/instances/{id}/{action}` for start, stop, hibernate,
//!   resume and terminate
//! - `GET {base}/v1/instances/{id}` for the current status

use async_trait::async_trait;
use prism_store::ProviderState;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{ProviderError, Result};
use crate::provider::{Provider, ProviderAction};
use crate::types::{ProviderConfig, ProviderStatus};

/// HTTP client for the provider adapter.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
}

/// Error response from the adapter.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[allow(dead_code)]
    code: u16,
}

impl HttpProvider {
    /// Create a new provider client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Create a new provider client with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Get the base URL of the adapter.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_action(&self, action: ProviderAction, provider_id: &str) -> Result<ProviderStatus> {
        let url = format!(
            "{}/v1/instances/{}/{}",
            self.base_url,
            provider_id,
            action.as_str()
        );

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status().is_success() {
            let status = response
                .json::<ProviderStatus>()
                .await
                .map_err(|e| ProviderError::Transient(format!("failed to parse response: {e}")))?;
            tracing::debug!(
                provider_id,
                action = %action,
                state = ?status.state,
                "Provider accepted action"
            );
            Ok(status)
        } else {
            let err = error_from_response(response, provider_id).await;
            tracing::warn!(provider_id, action = %action, error = %err, "Provider action failed");
            Err(err)
        }
    }
}

/// Classify a reqwest transport failure.
fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Transient(format!("provider request timed out: {e}"))
    } else {
        ProviderError::Transient(format!("provider request failed: {e}"))
    }
}

/// Classify a non-success response.
async fn error_from_response(response: reqwest::Response, provider_id: &str) -> ProviderError {
    let status = response.status();
    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| format!("provider returned status {status}"));

    if status == StatusCode::NOT_FOUND {
        ProviderError::NotFound(provider_id.to_string())
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn start(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.post_action(ProviderAction::Start, provider_id).await
    }

    async fn stop(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.post_action(ProviderAction::Stop, provider_id).await
    }

    async fn hibernate(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.post_action(ProviderAction::Hibernate, provider_id).await
    }

    async fn resume(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.post_action(ProviderAction::Resume, provider_id).await
    }

    async fn terminate(&self, provider_id: &str) -> Result<ProviderStatus> {
        self.post_action(ProviderAction::Terminate, provider_id).await
    }

    async fn describe_status(&self, provider_id: &str) -> Result<ProviderStatus> {
        let url = format!("{}/v1/instances/{}", self.base_url, provider_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status().is_success() {
            response
                .json::<ProviderStatus>()
                .await
                .map_err(|e| ProviderError::Transient(format!("failed to parse response: {e}")))
        } else if response.status() == StatusCode::NOT_FOUND {
            Ok(ProviderStatus::new(ProviderState::NotFound))
        } else {
            Err(error_from_response(response, provider_id).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpProvider {
        HttpProvider::with_client(reqwest::Client::new(), server.uri())
    }

    #[tokio::test]
    async fn hibernate_returns_reported_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/instances/i-123/hibernate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "state": "hibernating",
                "changed_at": "2026-03-01T10:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let status = client_for(&server).hibernate("i-123").await.unwrap();
        assert_eq!(status.state, ProviderState::Hibernating);
        assert!(status.changed_at.is_some());
    }

    #[tokio::test]
    async fn throttling_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/instances/i-123/stop"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(serde_json::json!({"error": "slow down", "code": 429})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).stop("i-123").await.unwrap_err();
        assert_eq!(err, ProviderError::Transient("slow down".to_string()));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/instances/i-123/hibernate"))
            .respond_with(ResponseTemplate::new(400).set_body_string("not hibernatable"))
            .mount(&server)
            .await;

        let err = client_for(&server).hibernate("i-123").await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn unknown_instance_describes_as_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/instances/i-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = client_for(&server);
        let status = provider.describe_status("i-gone").await.unwrap();
        assert_eq!(status.state, ProviderState::NotFound);
    }

    #[tokio::test]
    async fn action_on_unknown_instance_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/instances/i-gone/start"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server).start("i-gone").await.unwrap_err();
        assert_eq!(err, ProviderError::NotFound("i-gone".to_string()));
    }

    #[tokio::test]
    async fn unreachable_adapter_is_transient() {
        let provider = HttpProvider::with_client(reqwest::Client::new(), "http://127.0.0.1:1");
        let err = provider.describe_status("i-1").await.unwrap_err();
        assert!(err.is_retriable());
    }
}
