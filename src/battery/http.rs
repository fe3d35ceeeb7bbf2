#![allow(dead_code)]
//! Cloud HTTP/JSON transport. The vendor wraps every payload in a
//! `{"response": ...}` envelope and exposes the site as a numeric
//! energy-site id.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{json, Value};

use super::{BatteryController, BatteryError};
use crate::domain::{ExportRule, LiveStatus, OperationMode, SiteInfo, TariffDocument};
use crate::prices::TokenProvider;
use crate::tariff::wire;

pub struct HttpBattery {
    base_url: String,
    site_id: String,
    token: TokenProvider,
    client: reqwest::Client,
    live_client: reqwest::Client,
}

impl HttpBattery {
    pub fn new(
        base_url: impl Into<String>,
        site_id: impl Into<String>,
        token: TokenProvider,
    ) -> Result<Self, BatteryError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("gridsync/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers.clone())
            .build()
            .map_err(|e| BatteryError::Transport(e.to_string()))?;
        // Live telemetry is only useful fresh; short deadline.
        let live_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .map_err(|e| BatteryError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            site_id: site_id.into(),
            token,
            client,
            live_client,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/api/1/energy_sites/{}/{}",
            self.base_url, self.site_id, suffix
        )
    }

    async fn get(&self, suffix: &str) -> Result<Value, BatteryError> {
        self.request(self.client.get(self.url(suffix))).await
    }

    async fn get_live(&self, suffix: &str) -> Result<Value, BatteryError> {
        self.request(self.live_client.get(self.url(suffix))).await
    }

    async fn post(&self, suffix: &str, body: Value) -> Result<Value, BatteryError> {
        self.request(self.client.post(self.url(suffix)).json(&body)).await
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<Value, BatteryError> {
        // Token is read per call so external refresh propagates.
        let resp = builder.bearer_auth((self.token)()).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BatteryError::from_status(status, &body));
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| BatteryError::Protocol(format!("body parse: {}", e)))?;
        Ok(value["response"].clone())
    }
}

#[async_trait]
impl BatteryController for HttpBattery {
    async fn upload_tariff(&self, doc: &TariffDocument) -> Result<(), BatteryError> {
        let payload = json!({ "tariff_content": wire::to_provider_json(doc) });
        self.post("tariff", payload).await?;
        Ok(())
    }

    async fn get_tariff(&self) -> Result<Option<TariffDocument>, BatteryError> {
        let response = self.get("tariff").await?;
        if response.is_null() {
            return Ok(None);
        }
        Ok(wire::from_provider_json(&response["tariff_content"]))
    }

    async fn get_site_info(&self) -> Result<SiteInfo, BatteryError> {
        let response = self.get("site_info").await?;
        let operation_mode = response["default_real_mode"]
            .as_str()
            .unwrap_or("self_consumption")
            .parse()
            .map_err(BatteryError::Protocol)?;
        let export_rule = response["components"]["customer_preferred_export_rule"]
            .as_str()
            .and_then(|s| s.parse().ok());
        Ok(SiteInfo {
            operation_mode,
            backup_reserve_percent: response["backup_reserve_percent"].as_f64().unwrap_or(0.0),
            export_rule,
            timezone: response["installation_time_zone"]
                .as_str()
                .unwrap_or("UTC")
                .to_string(),
        })
    }

    async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), BatteryError> {
        self.post("operation", json!({ "default_real_mode": mode.to_string() }))
            .await?;
        Ok(())
    }

    async fn set_backup_reserve(&self, percent: f64) -> Result<(), BatteryError> {
        self.post("backup", json!({ "backup_reserve_percent": percent }))
            .await?;
        Ok(())
    }

    async fn set_export_rule(&self, rule: ExportRule) -> Result<(), BatteryError> {
        self.post(
            "grid_import_export",
            json!({ "customer_preferred_export_rule": rule.to_string() }),
        )
        .await?;
        Ok(())
    }

    async fn set_grid_charging(&self, enabled: bool) -> Result<(), BatteryError> {
        self.post(
            "grid_import_export",
            json!({ "disallow_charge_from_grid_with_solar_installed": !enabled }),
        )
        .await?;
        Ok(())
    }

    async fn get_live_status(&self) -> Result<LiveStatus, BatteryError> {
        let response = self.get_live("live_status").await?;
        let soc = response["percentage_charged"]
            .as_f64()
            .ok_or_else(|| BatteryError::Protocol("live_status missing percentage_charged".to_string()))?;
        Ok(LiveStatus {
            battery_soc: soc,
            grid_power_w: response["grid_power"].as_f64().unwrap_or(0.0),
            solar_power_w: response["solar_power"].as_f64().unwrap_or(0.0),
            battery_power_w: response["battery_power"].as_f64().unwrap_or(0.0),
            load_power_w: response["load_power"].as_f64().unwrap_or(0.0),
            captured_at: Utc::now(),
        })
    }
}
