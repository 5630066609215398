//! Session gateway
//!
//! The pipeline never handles credentials directly. It asks a
//! [`SessionGateway`] for a usable upstream token and for the user behind a
//! socket client's token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::sessions;
use crate::error::{PipelineError, PipelineResult};
use crate::provider::ProviderApi;
use crate::rate_limiter::RateLimiter;

/// Source of upstream tokens and client identities
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// A non-expired upstream token, if one can be had
    async fn get_valid_token(&self) -> PipelineResult<Option<String>>;

    /// Expiry of the token `get_valid_token` hands out
    async fn token_expires_at(&self) -> PipelineResult<Option<DateTime<Utc>>>;

    /// User id for a socket client token; `None` if unknown or expired
    async fn resolve_client_token(&self, token: &str) -> PipelineResult<Option<String>>;
}

/// Gateway backed by the console's session tables
///
/// When no valid provider session exists but account credentials are
/// stored, it authenticates once (through the rate limiter) and records the
/// new session.
pub struct SqliteSessionGateway {
    pool: SqlitePool,
    provider: Arc<dyn ProviderApi>,
    limiter: Arc<RateLimiter>,
}

impl SqliteSessionGateway {
    pub fn new(pool: SqlitePool, provider: Arc<dyn ProviderApi>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            pool,
            provider,
            limiter,
        }
    }

    async fn refresh_session(&self) -> PipelineResult<Option<(String, DateTime<Utc>)>> {
        let Some((username, password_hash)) = sessions::provider_credentials(&self.pool).await?
        else {
            warn!("No valid provider session and no provider credentials configured");
            return Ok(None);
        };

        let provider = self.provider.clone();
        let session = self
            .limiter
            .execute(|| {
                let provider = provider.clone();
                let username = username.clone();
                let password_hash = password_hash.clone();
                async move { provider.authenticate(&username, &password_hash).await }
            })
            .await?;

        sessions::insert_provider_session(&self.pool, None, &session.token, session.expires_at)
            .await?;
        info!(expires_at = %session.expires_at, "Obtained new provider session");
        Ok(Some((session.token, session.expires_at)))
    }

    async fn current_session(&self) -> PipelineResult<Option<(String, DateTime<Utc>)>> {
        if let Some(session) = sessions::latest_valid_provider_session(&self.pool, Utc::now()).await? {
            return Ok(Some(session));
        }
        self.refresh_session().await
    }
}

#[async_trait]
impl SessionGateway for SqliteSessionGateway {
    async fn get_valid_token(&self) -> PipelineResult<Option<String>> {
        Ok(self.current_session().await?.map(|(token, _)| token))
    }

    async fn token_expires_at(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        let session = sessions::latest_valid_provider_session(&self.pool, Utc::now()).await?;
        Ok(session.map(|(_, expires_at)| expires_at))
    }

    async fn resolve_client_token(&self, token: &str) -> PipelineResult<Option<String>> {
        if token.trim().is_empty() {
            return Err(PipelineError::Auth("empty client token".to_string()));
        }
        Ok(sessions::user_for_client_token(&self.pool, token, Utc::now()).await?)
    }
}
