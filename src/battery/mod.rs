#![allow(dead_code)]
//! Battery controller facade. One trait, three transports (cloud
//! HTTP/JSON, Modbus gateway, proprietary cloud RPC), and a per-site
//! wrapper that owns retries, upload serialization and export-rule
//! read-back bookkeeping.

pub mod http;
#[cfg(feature = "modbus")]
pub mod modbus;
pub mod rpc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{ExportRule, LiveStatus, OperationMode, SiteInfo, TariffDocument};

#[derive(Debug, Error)]
pub enum BatteryError {
    /// Network-level failure or a 5xx from the vendor; retry eligible.
    #[error("Communication error: {0}")]
    Transport(String),
    /// The vendor rejected the request (4xx); retrying cannot help.
    #[error("Request rejected: {0}")]
    Client(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Malformed response: {0}")]
    Protocol(String),
}

impl BatteryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatteryError::Transport(_))
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            BatteryError::Auth(format!("HTTP {}: {}", status, body))
        } else if status.is_client_error() {
            BatteryError::Client(format!("HTTP {}: {}", status, body))
        } else {
            BatteryError::Transport(format!("HTTP {}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for BatteryError {
    fn from(e: reqwest::Error) -> Self {
        BatteryError::Transport(e.to_string())
    }
}

/// Per-battery-system adapter. Implementations translate the neutral
/// tariff document into their native format and surface vendor errors
/// through [`BatteryError`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatteryController: Send + Sync {
    /// Atomic tariff replacement.
    async fn upload_tariff(&self, doc: &TariffDocument) -> Result<(), BatteryError>;

    /// Read the currently installed tariff, when the vendor exposes it.
    async fn get_tariff(&self) -> Result<Option<TariffDocument>, BatteryError>;

    async fn get_site_info(&self) -> Result<SiteInfo, BatteryError>;

    async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), BatteryError>;

    async fn set_backup_reserve(&self, percent: f64) -> Result<(), BatteryError>;

    async fn set_export_rule(&self, rule: ExportRule) -> Result<(), BatteryError>;

    async fn set_grid_charging(&self, enabled: bool) -> Result<(), BatteryError>;

    async fn get_live_status(&self) -> Result<LiveStatus, BatteryError>;
}

const UPLOAD_MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Facade over a controller for one physical site. Serializes tariff
/// uploads, retries transient failures with exponential backoff, and
/// tracks whether the last export-rule write was verified by read-back.
pub struct SiteFacade {
    controller: Arc<dyn BatteryController>,
    upload_lock: tokio::sync::Mutex<()>,
    export_rule_unverified: AtomicBool,
}

impl SiteFacade {
    pub fn new(controller: Arc<dyn BatteryController>) -> Self {
        Self {
            controller,
            upload_lock: tokio::sync::Mutex::new(()),
            export_rule_unverified: AtomicBool::new(false),
        }
    }

    pub fn controller(&self) -> &Arc<dyn BatteryController> {
        &self.controller
    }

    /// Upload with up to three attempts (1 s, 2 s, 4 s backoff). Client
    /// and auth errors abort immediately. Concurrent uploads for the
    /// site are serialized here.
    pub async fn upload_tariff(&self, doc: &TariffDocument) -> Result<(), BatteryError> {
        doc.validate()
            .map_err(|e| BatteryError::Client(e.to_string()))?;
        let _guard = self.upload_lock.lock().await;

        let mut backoff = BACKOFF_BASE;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.controller.upload_tariff(doc).await {
                Ok(()) => {
                    debug!(attempt, "tariff upload accepted");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < UPLOAD_MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "tariff upload failed - retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the export rule and verify it by read-back. Returns whether
    /// the write was verified. A null read-back (an API quirk on some
    /// firmwares) leaves the write trusted but unverified, which makes
    /// the next write unconditional.
    pub async fn set_export_rule(&self, rule: ExportRule) -> Result<bool, BatteryError> {
        self.controller.set_export_rule(rule).await?;
        match self.controller.get_site_info().await {
            Ok(info) => match info.export_rule {
                Some(read_back) if read_back == rule => {
                    self.export_rule_unverified.store(false, Ordering::SeqCst);
                    Ok(true)
                }
                Some(read_back) => {
                    warn!(%rule, %read_back, "export rule read-back disagrees with write");
                    self.export_rule_unverified.store(true, Ordering::SeqCst);
                    Ok(false)
                }
                None => {
                    warn!(%rule, "export rule read-back returned nothing - trusting write unverified");
                    self.export_rule_unverified.store(true, Ordering::SeqCst);
                    Ok(false)
                }
            },
            Err(e) => {
                warn!(%rule, error = %e, "export rule read-back failed");
                self.export_rule_unverified.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    /// Whether a write for `requested` should go out given the cached
    /// rule. Unverified state forces the write through.
    pub fn export_rule_needs_write(&self, requested: ExportRule, cached: Option<ExportRule>) -> bool {
        self.export_rule_unverified.load(Ordering::SeqCst) || cached != Some(requested)
    }

    pub async fn get_tariff(&self) -> Result<Option<TariffDocument>, BatteryError> {
        self.controller.get_tariff().await
    }

    pub async fn get_site_info(&self) -> Result<SiteInfo, BatteryError> {
        self.controller.get_site_info().await
    }

    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), BatteryError> {
        self.controller.set_operation_mode(mode).await
    }

    pub async fn set_backup_reserve(&self, percent: f64) -> Result<(), BatteryError> {
        self.controller.set_backup_reserve(percent.clamp(0.0, 100.0)).await
    }

    pub async fn set_grid_charging(&self, enabled: bool) -> Result<(), BatteryError> {
        self.controller.set_grid_charging(enabled).await
    }

    pub async fn get_live_status(&self) -> Result<LiveStatus, BatteryError> {
        self.controller.get_live_status().await
    }
}
