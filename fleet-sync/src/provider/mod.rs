//! Telemetry provider integration
//!
//! [`ProviderApi`] is the seam between the pipeline and the GPS provider.
//! The production implementation is [`http::HttpProviderClient`]; tests
//! substitute scripted fakes.

pub mod decode;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

pub use decode::decode_position;
pub use http::HttpProviderClient;

/// Upstream session token issued by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Provider answer to a positions-since-watermark query
///
/// Records are kept as raw JSON so each one can be decoded (and rejected)
/// on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionsResponse {
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    #[serde(default, alias = "nextWatermark")]
    pub next_watermark: Option<String>,
    #[serde(default, alias = "statusCode")]
    pub status_code: i64,
    #[serde(default, alias = "errorMessage")]
    pub error_message: Option<String>,
}

impl PositionsResponse {
    /// Turn a non-zero provider status into [`PipelineError::Provider`]
    pub fn check_status(self) -> PipelineResult<Self> {
        if self.status_code == 0 {
            Ok(self)
        } else {
            Err(PipelineError::Provider {
                status_code: self.status_code,
                message: self
                    .error_message
                    .unwrap_or_else(|| "provider returned an error status".to_string()),
            })
        }
    }
}

/// Operations the pipeline needs from the provider
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Exchange credentials for a session token
    async fn authenticate(
        &self,
        username: &str,
        password_hash: &str,
    ) -> PipelineResult<ProviderSession>;

    /// Positions reported since `since`
    ///
    /// An empty `device_ids` slice means every device on the account.
    async fn fetch_positions(
        &self,
        token: &str,
        device_ids: &[String],
        since: Option<&str>,
    ) -> PipelineResult<PositionsResponse>;
}
