#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

use crate::prices::retailer::ForecastClass;
use crate::tariff::ModifierConfig;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub auth: AuthConfig,

    #[validate(nested)]
    pub site: SiteConfig,

    #[validate(nested)]
    pub provider: ProviderConfig,

    #[validate(nested)]
    pub battery: BatteryConfig,

    #[validate(nested)]
    pub sync: SyncConfig,

    #[serde(default)]
    #[validate(nested)]
    pub spike: SpikeConfig,

    #[serde(default)]
    #[validate(nested)]
    pub curtailment: CurtailmentConfig,

    #[serde(default)]
    #[validate(nested)]
    pub store: StoreConfig,

    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default)]
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("Failed to parse socket address")
    }
}

/// API authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AuthConfig {
    #[validate(length(min = 32))]
    pub token: String,
}

/// Physical site configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SiteConfig {
    /// IANA timezone the tariff slots are computed in.
    #[validate(length(min = 1))]
    pub timezone: String,
}

impl SiteConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid timezone {}: {}", self.timezone, e))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Retailer,
    Wholesale,
    RateCard,
}

/// Price provider configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_token: Option<String>,

    /// Retailer site identifier.
    #[serde(default)]
    pub site_id: Option<String>,

    /// Wholesale market region (e.g. NSW1).
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub forecast_class: ForecastClass,

    /// Preset rate card id for `rate_card` providers.
    #[serde(default)]
    pub rate_card_preset: Option<String>,

    /// Streaming endpoint; absent disables the stream client.
    #[serde(default)]
    pub stream_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatterySystem {
    Http,
    Modbus,
    Rpc,
}

/// Battery transport configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BatteryConfig {
    pub system: BatterySystem,

    #[serde(default = "default_battery_base_url")]
    pub base_url: String,

    #[validate(length(min = 1))]
    pub site_id: String,

    #[serde(default)]
    pub api_token: Option<String>,

    /// `host:port` of the Modbus gateway.
    #[serde(default)]
    pub gateway_addr: Option<String>,

    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    #[serde(default)]
    pub settled_only: bool,

    #[serde(default = "default_price_threshold")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub price_change_threshold_cents: f64,

    #[serde(default = "default_horizon_minutes")]
    #[validate(range(min = 30, max = 2880))]
    pub forecast_horizon_minutes: i64,

    #[serde(default = "default_tariff_name")]
    pub tariff_name: String,

    #[serde(default = "default_utility")]
    pub utility: String,

    #[serde(default = "default_tariff_code")]
    pub tariff_code: String,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default)]
    pub daily_charge: f64,

    #[serde(default)]
    pub modifiers: ModifierConfig,

    /// `HH:MM` demand window during which grid charging is re-asserted
    /// off after each upload.
    #[serde(default)]
    pub demand_window_start: Option<String>,
    #[serde(default)]
    pub demand_window_end: Option<String>,

    #[serde(default)]
    pub force_tariff_refresh: bool,
}

/// Spike manager configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SpikeConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_spike_region")]
    pub region: String,

    /// Trigger threshold in dollars per MWh.
    #[serde(default = "default_spike_threshold")]
    #[validate(range(min = 50.0, max = 20000.0))]
    pub threshold_dollars_per_mwh: f64,

    /// Half-hour slots the spike sell rate covers.
    #[serde(default = "default_spike_window_slots")]
    #[validate(range(min = 1, max = 48))]
    pub window_slots: usize,

    /// Wholesale market API polled for the spike region.
    #[serde(default = "default_wholesale_url")]
    pub wholesale_url: String,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: default_spike_region(),
            threshold_dollars_per_mwh: default_spike_threshold(),
            window_slots: default_spike_window_slots(),
            wholesale_url: default_wholesale_url(),
        }
    }
}

/// Curtailment configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CurtailmentConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_restore_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub restore_soc: f64,

    #[serde(default = "default_reassert_secs")]
    pub reassert_secs: u64,

    #[serde(default)]
    pub inverter_brand: Option<String>,

    #[serde(default)]
    pub inverter_addr: Option<String>,

    #[serde(default = "default_unit_id")]
    pub inverter_unit_id: u8,
}

impl Default for CurtailmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            restore_soc: default_restore_soc(),
            reassert_secs: default_reassert_secs(),
            inverter_brand: None,
            inverter_addr: None,
            inverter_unit_id: default_unit_id(),
        }
    }
}

/// State store configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_json: false }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_provider_base_url() -> String { "https://api.amber.com.au".to_string() }
fn default_battery_base_url() -> String { "https://owner-api.energy.example".to_string() }
fn default_unit_id() -> u8 { 1 }
fn default_price_threshold() -> f64 { 0.5 }
fn default_horizon_minutes() -> i64 { 24 * 60 }
fn default_tariff_name() -> String { "Dynamic Sync".to_string() }
fn default_utility() -> String { "Dynamic Retail".to_string() }
fn default_tariff_code() -> String { "DYN-SYNC".to_string() }
fn default_currency() -> String { "AUD".to_string() }
fn default_spike_region() -> String { "NSW1".to_string() }
fn default_spike_threshold() -> f64 { 300.0 }
fn default_wholesale_url() -> String { "https://visualisations.aemo.com.au/aemo/apps/api".to_string() }
fn default_spike_window_slots() -> usize { 4 }
fn default_restore_soc() -> f64 { 30.0 }
fn default_reassert_secs() -> u64 { 45 }
fn default_store_path() -> PathBuf { PathBuf::from("data/gridsync_state.json") }
fn default_log_level() -> String { "info".to_string() }

impl AppConfig {
    /// Load configuration from TOML files and environment variables.
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. config/default.toml
    /// 2. config/<environment>.toml when an environment is named
    /// 3. Environment variables with GRIDSYNC__ prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{}.toml", env)));
        }

        figment = figment.merge(Env::prefixed("GRIDSYNC__").split("__"));

        let config: AppConfig = figment.extract().context("Failed to parse configuration")?;
        config.validate().context("Configuration validation failed")?;
        config.cross_validate()?;
        Ok(config)
    }

    /// Checks that span sections.
    fn cross_validate(&self) -> Result<()> {
        self.site.tz()?;
        match self.provider.kind {
            ProviderKind::Retailer => {
                if self.provider.site_id.is_none() || self.provider.api_token.is_none() {
                    anyhow::bail!("retailer provider needs site_id and api_token");
                }
            }
            ProviderKind::Wholesale => {
                if self.provider.region.is_none() {
                    anyhow::bail!("wholesale provider needs a region");
                }
            }
            ProviderKind::RateCard => {
                if self.provider.rate_card_preset.is_none() {
                    anyhow::bail!("rate_card provider needs rate_card_preset");
                }
            }
        }
        if self.battery.system == BatterySystem::Modbus && self.battery.gateway_addr.is_none() {
            anyhow::bail!("modbus battery needs gateway_addr");
        }
        Ok(())
    }

    pub fn tariff_metadata(&self) -> crate::domain::TariffMetadata {
        crate::domain::TariffMetadata {
            name: self.sync.tariff_name.clone(),
            utility: self.sync.utility.clone(),
            code: self.sync.tariff_code.clone(),
            currency: self.sync.currency.clone(),
            daily_charge: self.sync.daily_charge,
            demand_charges: vec![],
        }
    }
}

pub type Config = AppConfig;

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8320,
                enable_cors: false,
            },
            auth: AuthConfig {
                token: "0123456789abcdef0123456789abcdef".to_string(),
            },
            site: SiteConfig { timezone: "Australia/Sydney".to_string() },
            provider: ProviderConfig {
                kind: ProviderKind::Retailer,
                base_url: default_provider_base_url(),
                api_token: Some("psk_0123456789abcdef01234567".to_string()),
                site_id: Some("SITE1".to_string()),
                region: None,
                forecast_class: ForecastClass::Predicted,
                rate_card_preset: None,
                stream_url: Some("wss://stream.example".to_string()),
            },
            battery: BatteryConfig {
                system: BatterySystem::Http,
                base_url: default_battery_base_url(),
                site_id: "1234567890123456".to_string(),
                api_token: Some("tok".to_string()),
                gateway_addr: None,
                unit_id: 1,
            },
            sync: SyncConfig {
                auto_sync: true,
                settled_only: false,
                price_change_threshold_cents: 0.5,
                forecast_horizon_minutes: 1440,
                tariff_name: default_tariff_name(),
                utility: default_utility(),
                tariff_code: default_tariff_code(),
                currency: default_currency(),
                daily_charge: 1.1,
                modifiers: ModifierConfig::default(),
                demand_window_start: None,
                demand_window_end: None,
                force_tariff_refresh: false,
            },
            spike: SpikeConfig::default(),
            curtailment: CurtailmentConfig::default(),
            store: StoreConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let config = base_config();
        config.validate().unwrap();
        config.cross_validate().unwrap();
    }

    #[test]
    fn test_socket_addr() {
        let config = base_config();
        assert_eq!(config.server.socket_addr().unwrap().port(), 8320);
    }

    #[test]
    fn test_retailer_requires_credentials() {
        let mut config = base_config();
        config.provider.api_token = None;
        assert!(config.cross_validate().is_err());
    }

    #[test]
    fn test_wholesale_requires_region() {
        let mut config = base_config();
        config.provider.kind = ProviderKind::Wholesale;
        config.provider.region = None;
        assert!(config.cross_validate().is_err());
    }

    #[test]
    fn test_modbus_requires_gateway() {
        let mut config = base_config();
        config.battery.system = BatterySystem::Modbus;
        config.battery.gateway_addr = None;
        assert!(config.cross_validate().is_err());
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let mut config = base_config();
        config.site.timezone = "Mars/Olympus".to_string();
        assert!(config.cross_validate().is_err());
    }

    #[test]
    fn test_short_auth_token_rejected() {
        let mut config = base_config();
        config.auth.token = "short".to_string();
        assert!(config.validate().is_err());
    }
}
