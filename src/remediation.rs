use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::RemediationError;

/// Infrastructure-level remediation, issued at most once per escalation.
#[async_trait]
pub trait RemediationApi: Send + Sync {
    /// Asks the provider to reboot `host_id`. Makes exactly one request.
    async fn reboot_host(&self, host_id: &str, timeout: Duration) -> Result<(), RemediationError>;
}

/// Reboots a droplet through the DigitalOcean actions endpoint.
pub struct DigitalOceanClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl DigitalOceanClient {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            token,
        }
    }

    fn actions_url(&self, host_id: &str) -> String {
        format!(
            "{}/v2/droplets/{}/actions",
            self.api_url.trim_end_matches('/'),
            host_id
        )
    }
}

#[async_trait]
impl RemediationApi for DigitalOceanClient {
    async fn reboot_host(&self, host_id: &str, timeout: Duration) -> Result<(), RemediationError> {
        let token = self.token.as_deref().ok_or(RemediationError::NotConfigured)?;
        if host_id.trim().is_empty() {
            return Err(RemediationError::NotConfigured);
        }

        info!("Requesting reboot of host {}", host_id);
        let request = self
            .http
            .post(self.actions_url(host_id))
            .bearer_auth(token)
            .json(&json!({ "type": "reboot" }))
            .timeout(timeout)
            .send();

        let response = match tokio::time::timeout(timeout, request).await {
            Err(_) => return Err(RemediationError::Timeout(timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(RemediationError::Timeout(timeout)),
            Ok(Err(e)) => return Err(RemediationError::Transport(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Reboot request for host {} rejected: {} {}", host_id, status, body);
            return Err(RemediationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_reboot_posts_action() {
        let server = MockServer::start_async().await;
        let reboot = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v2/droplets/123/actions")
                    .header("authorization", "Bearer do-token")
                    .json_body(json!({ "type": "reboot" }));
                then.status(201).json_body(json!({
                    "action": { "id": 1, "status": "in-progress", "type": "reboot" }
                }));
            })
            .await;

        let client = DigitalOceanClient::new(
            reqwest::Client::new(),
            server.base_url(),
            Some("do-token".to_string()),
        );
        client.reboot_host("123", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reboot.calls_async().await, 1);
    }

    #[tokio::test]
    async fn test_reboot_rejected_status() {
        let server = MockServer::start_async().await;
        let reboot = server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/droplets/123/actions");
                then.status(401).body("unauthorized");
            })
            .await;

        let client = DigitalOceanClient::new(
            reqwest::Client::new(),
            server.base_url(),
            Some("bad".to_string()),
        );
        let err = client.reboot_host("123", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RemediationError::Status { status: 401, .. }));
        // Exactly one request, never retried
        assert_eq!(reboot.calls_async().await, 1);
    }

    #[tokio::test]
    async fn test_reboot_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v2/droplets/123/actions");
                then.status(201).delay(Duration::from_secs(2));
            })
            .await;

        let client = DigitalOceanClient::new(
            reqwest::Client::new(),
            server.base_url(),
            Some("do-token".to_string()),
        );
        let err = client
            .reboot_host("123", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RemediationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_token_is_not_configured() {
        let client = DigitalOceanClient::new(reqwest::Client::new(), "http://127.0.0.1:9", None);
        let err = client.reboot_host("123", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RemediationError::NotConfigured));
    }
}
