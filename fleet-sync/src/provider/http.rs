//! HTTP client for the telemetry provider

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{PositionsResponse, ProviderApi, ProviderSession};
use crate::error::{PipelineError, PipelineResult};

const USER_AGENT: &str = concat!("fleet-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password_hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, alias = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "statusCode")]
    status_code: i64,
    #[serde(default, alias = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PositionsRequest<'a> {
    token: &'a str,
    device_ids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<&'a str>,
}

/// reqwest-backed [`ProviderApi`]
pub struct HttpProviderClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpProviderClient {
    /// Build a client; `timeout` bounds every request end to end
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> PipelineResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> PipelineResult<String> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "Calling provider");

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(PipelineError::Transport(format!(
                "HTTP {} from provider: {}",
                status.as_u16(),
                text.chars().take(200).collect::<String>()
            )));
        }

        Ok(text)
    }
}

#[async_trait]
impl ProviderApi for HttpProviderClient {
    async fn authenticate(
        &self,
        username: &str,
        password_hash: &str,
    ) -> PipelineResult<ProviderSession> {
        let body = self
            .post_json(
                "auth",
                &AuthRequest {
                    username,
                    password_hash,
                },
            )
            .await?;

        let response: AuthResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::MalformedPayload(e.to_string()))?;

        if response.status_code != 0 {
            return Err(PipelineError::Auth(response.error_message.unwrap_or_else(|| {
                format!("provider rejected credentials (status {})", response.status_code)
            })));
        }

        match (response.token, response.expires_at) {
            (Some(token), Some(expires_at)) if !token.is_empty() => {
                Ok(ProviderSession { token, expires_at })
            }
            _ => Err(PipelineError::MalformedPayload(
                "auth response missing token or expiry".to_string(),
            )),
        }
    }

    async fn fetch_positions(
        &self,
        token: &str,
        device_ids: &[String],
        since: Option<&str>,
    ) -> PipelineResult<PositionsResponse> {
        let body = self
            .post_json(
                "positions",
                &PositionsRequest {
                    token,
                    device_ids,
                    since,
                },
            )
            .await?;

        serde_json::from_str(&body).map_err(|e| PipelineError::MalformedPayload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_trims_base_url() {
        let client = HttpProviderClient::new("http://gps.example.com/api/", Duration::from_secs(15)).unwrap();
        assert_eq!(client.base_url, "http://gps.example.com/api");
    }

    #[test]
    fn test_positions_request_omits_missing_watermark() {
        let ids = vec!["D1".to_string()];
        let json = serde_json::to_value(PositionsRequest {
            token: "t",
            device_ids: &ids,
            since: None,
        })
        .unwrap();
        assert!(json.get("since").is_none());
        assert_eq!(json["device_ids"][0], "D1");
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transport_error() {
        // Port 9 (discard) on localhost is closed in test environments
        let client = HttpProviderClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let result = client.fetch_positions("token", &[], None).await;
        assert!(matches!(result, Err(PipelineError::Transport(_))));
    }
}
