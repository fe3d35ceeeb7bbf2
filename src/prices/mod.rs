#![allow(dead_code)]
pub mod rate_card;
pub mod retailer;
pub mod stream;
pub mod wholesale;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{PricePoint, PriceSnapshot};

/// Credentials are read through this on every call so external token
/// refresh propagates without restarting the worker.
pub type TokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

pub fn static_token(token: impl Into<String>) -> TokenProvider {
    let token = token.into();
    Arc::new(move || token.clone())
}

/// Adapter failure taxonomy. Transport errors are retry-eligible; auth
/// errors are terminal for the invocation; missing data is surfaced so
/// the caller can skip the stage instead of uploading a half-built tariff.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Authentication rejected: {0}")]
    Auth(String),
    #[error("Source returned no data")]
    MissingData,
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transport(_))
    }

    /// Classify an HTTP response status the way every adapter does:
    /// 401/403 is an auth failure, anything else non-2xx is transport.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            SourceError::Auth(format!("HTTP {}: {}", status, body))
        } else {
            SourceError::Transport(format!("HTTP {}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Transport(e.to_string())
    }
}

/// Uniform read interface over the three provider families. All
/// implementations emit the same forecast record shape.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// The most recent price for the interval in progress, both channels.
    async fn current(&self) -> Result<PriceSnapshot, SourceError>;

    /// Forecast points from now out to `horizon_minutes`.
    async fn forecast(&self, horizon_minutes: i64) -> Result<Vec<PricePoint>, SourceError>;

    /// Settled (finalized) points, where the provider publishes them.
    async fn settled(&self) -> Result<Vec<PricePoint>, SourceError> {
        Ok(Vec::new())
    }

    /// Whether this source carries dynamic data worth re-syncing each
    /// interval. A static rate card has nothing new to say.
    fn is_dynamic(&self) -> bool {
        true
    }
}
