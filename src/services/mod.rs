//! Calls to downstream remediation services.
//!
//! The orchestrator only ever sees [`ServiceClient`]: "call service, get a
//! JSON result or a typed error". [`HttpServiceClient`] is the production
//! implementation; tests substitute in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::ServiceError;
use crate::scheduler::Payload;

/// Default timeout for a single HTTP call.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Longest error body kept in an application error.
const MAX_ERROR_BODY: usize = 512;

/// A registered service: its name and base endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub name: String,
    pub endpoint: String,
}

impl ServiceTarget {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }

    /// URL for an action: `{endpoint}/{action}`.
    pub fn action_url(&self, action: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            action.trim_start_matches('/')
        )
    }
}

/// Request/response access to a downstream service.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    async fn call(
        &self,
        target: &ServiceTarget,
        action: &str,
        payload: &Payload,
    ) -> Result<Value, ServiceError>;
}

/// JSON-over-HTTP service client.
///
/// Posts the payload to `{endpoint}/{action}` and returns the decoded JSON
/// body. Transport errors are mapped onto [`ServiceError`].
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    client: Client,
    timeout: Duration,
}

impl HttpServiceClient {
    /// Creates a client with the default request timeout.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    /// Whether `{endpoint}/health` answers with a 2xx status.
    pub async fn health_check(&self, target: &ServiceTarget) -> bool {
        match self.client.get(target.action_url("health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(service = %target.name, error = %e, "Health check failed");
                false
            }
        }
    }

    fn map_transport_error(&self, target: &ServiceTarget, action: &str, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout {
                service: target.name.clone(),
                action: action.to_string(),
                after: self.timeout,
            }
        } else {
            ServiceError::Connection {
                service: target.name.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    async fn call(
        &self,
        target: &ServiceTarget,
        action: &str,
        payload: &Payload,
    ) -> Result<Value, ServiceError> {
        let url = target.action_url(action);
        debug!(service = %target.name, action = %action, url = %url, "Calling service");

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| self.map_transport_error(target, action, e))?;

        let status = response.status();
        if !status.is_success() {
            let mut message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            return Err(ServiceError::Application {
                service: target.name.clone(),
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    self.map_transport_error(target, action, e)
                } else {
                    ServiceError::InvalidResponse {
                        service: target.name.clone(),
                        message: e.to_string(),
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_url_joins_cleanly() {
        let target = ServiceTarget::new("ci", "http://ci-service:8080/");
        assert_eq!(target.action_url("classify"), "http://ci-service:8080/classify");
        assert_eq!(target.action_url("/rerun"), "http://ci-service:8080/rerun");
    }

    #[tokio::test]
    async fn test_refused_connection_maps_to_connection_error() {
        let client = HttpServiceClient::with_timeout(Duration::from_secs(2)).expect("client");
        let target = ServiceTarget::new("nowhere", "http://127.0.0.1:1");

        let err = client
            .call(&target, "classify", &Payload::new())
            .await
            .expect_err("nothing listens on port 1");
        assert!(matches!(err, ServiceError::Connection { .. } | ServiceError::Timeout { .. }));
        assert!(err.is_transient());
        assert!(!client.health_check(&target).await);
    }
}
