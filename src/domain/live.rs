#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Battery operating mode hint. Autonomous lets the firmware arbitrage the
/// uploaded tariff; self-consumption only offsets home load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Autonomous,
    SelfConsumption,
}

impl std::str::FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "autonomous" => Ok(OperationMode::Autonomous),
            "self_consumption" | "self-consumption" => Ok(OperationMode::SelfConsumption),
            _ => Err(format!("Unknown operation mode: {}", s)),
        }
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Autonomous => write!(f, "autonomous"),
            OperationMode::SelfConsumption => write!(f, "self_consumption"),
        }
    }
}

/// Grid export permission for the battery system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportRule {
    /// No export at all (solar curtailed at the battery).
    Never,
    /// Battery and solar may both export.
    BatteryOk,
    /// Only excess solar may export.
    PvOnly,
}

impl std::str::FromStr for ExportRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" => Ok(ExportRule::Never),
            "battery_ok" | "battery-ok" => Ok(ExportRule::BatteryOk),
            "pv_only" | "pv-only" => Ok(ExportRule::PvOnly),
            _ => Err(format!("Unknown export rule: {}", s)),
        }
    }
}

impl std::fmt::Display for ExportRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportRule::Never => write!(f, "never"),
            ExportRule::BatteryOk => write!(f, "battery_ok"),
            ExportRule::PvOnly => write!(f, "pv_only"),
        }
    }
}

/// Point-in-time plant telemetry. Sign conventions: grid negative =
/// exporting, battery negative = charging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveStatus {
    pub battery_soc: f64,
    pub grid_power_w: f64,
    pub solar_power_w: f64,
    pub battery_power_w: f64,
    pub load_power_w: f64,
    pub captured_at: DateTime<Utc>,
}

impl LiveStatus {
    pub fn is_exporting(&self) -> bool {
        self.grid_power_w < 0.0
    }

    pub fn is_battery_charging(&self) -> bool {
        self.battery_power_w < 0.0
    }

    /// Charge power as a positive number of watts, zero when discharging.
    pub fn battery_charge_rate_w(&self) -> f64 {
        (-self.battery_power_w).max(0.0)
    }

    pub fn is_battery_full(&self) -> bool {
        self.battery_soc >= 100.0
    }
}

/// Site-level settings read back from the battery system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteInfo {
    pub operation_mode: OperationMode,
    pub backup_reserve_percent: f64,
    /// Some battery APIs omit this field; callers fall back to a
    /// persisted cache when absent.
    pub export_rule: Option<ExportRule>,
    pub timezone: String,
}
