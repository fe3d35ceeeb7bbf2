#![allow(dead_code)]
//! AC-coupled inverter control for direct solar curtailment. The battery
//! export rule and this are independent levers; the curtailment
//! controller drives both.

#[cfg(feature = "modbus")]
pub mod modbus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InverterError {
    #[error("Communication error: {0}")]
    Transport(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// How a curtailed inverter is held down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurtailMode {
    /// Zero output.
    Shutdown,
    /// Output pinned to household demand plus battery charge rate, for
    /// zero net export.
    LoadFollowing,
}

impl std::str::FromStr for CurtailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shutdown" => Ok(CurtailMode::Shutdown),
            "load_following" | "load-following" => Ok(CurtailMode::LoadFollowing),
            _ => Err(format!("Unknown curtail mode: {}", s)),
        }
    }
}

/// Last commanded inverter state, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverterState {
    Normal,
    Curtailed,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InverterController: Send + Sync {
    /// Pin output to `watts`. Implies leaving shutdown.
    async fn set_power_limit(&self, watts: f64) -> Result<(), InverterError>;

    /// Stop production entirely.
    async fn shutdown(&self) -> Result<(), InverterError>;

    /// Clear any limit and resume normal production.
    async fn restore(&self) -> Result<(), InverterError>;

    /// Some brands drop a power limit that is not re-issued every
    /// 45 seconds or so, even when the value has not changed.
    fn requires_periodic_reassertion(&self) -> bool {
        false
    }
}

/// Resolve a controller for a configured brand.
#[cfg(feature = "modbus")]
pub async fn for_brand(
    brand: &str,
    host: &str,
    unit_id: u8,
) -> Result<std::sync::Arc<dyn InverterController>, InverterError> {
    match brand.to_lowercase().as_str() {
        "sungrow" => Ok(std::sync::Arc::new(
            modbus::SungrowInverter::connect(host, unit_id).await?,
        )),
        other => Err(InverterError::Unsupported(format!(
            "inverter brand {} not supported",
            other
        ))),
    }
}
