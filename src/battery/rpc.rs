#![allow(dead_code)]
//! Proprietary cloud RPC transport: a single POST endpoint carrying
//! `{method, params}` envelopes. Kept wire-compatible with the vendor's
//! installer tooling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{json, Value};

use super::{BatteryController, BatteryError};
use crate::domain::{ExportRule, LiveStatus, OperationMode, SiteInfo, TariffDocument};
use crate::prices::TokenProvider;
use crate::tariff::wire;

pub struct RpcBattery {
    endpoint: String,
    site_id: String,
    token: TokenProvider,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcBattery {
    pub fn new(
        endpoint: impl Into<String>,
        site_id: impl Into<String>,
        token: TokenProvider,
    ) -> Result<Self, BatteryError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("gridsync/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| BatteryError::Transport(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            site_id: site_id.into(),
            token,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, rpc_method: &str, params: Value) -> Result<Value, BatteryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({
            "id": id,
            "method": rpc_method,
            "params": params,
            "siteId": self.site_id,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth((self.token)())
            .json(&envelope)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BatteryError::from_status(status, &body));
        }
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| BatteryError::Protocol(format!("body parse: {}", e)))?;
        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let code = error["code"].as_i64().unwrap_or(0);
            let message = error["message"].as_str().unwrap_or("rpc error").to_string();
            return Err(match code {
                -32001 => BatteryError::Auth(message),
                -32602 => BatteryError::Client(message),
                _ => BatteryError::Transport(message),
            });
        }
        Ok(value["result"].clone())
    }
}

#[async_trait]
impl BatteryController for RpcBattery {
    async fn upload_tariff(&self, doc: &TariffDocument) -> Result<(), BatteryError> {
        self.call("tariff.upload", json!({ "tariff": wire::to_provider_json(doc) }))
            .await?;
        Ok(())
    }

    async fn get_tariff(&self) -> Result<Option<TariffDocument>, BatteryError> {
        let result = self.call("tariff.get", json!({})).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(wire::from_provider_json(&result["tariff"]))
    }

    async fn get_site_info(&self) -> Result<SiteInfo, BatteryError> {
        let result = self.call("site.info", json!({})).await?;
        Ok(SiteInfo {
            operation_mode: result["operationMode"]
                .as_str()
                .unwrap_or("self_consumption")
                .parse()
                .map_err(BatteryError::Protocol)?,
            backup_reserve_percent: result["backupReservePercent"].as_f64().unwrap_or(0.0),
            export_rule: result["exportRule"].as_str().and_then(|s| s.parse().ok()),
            timezone: result["timezone"].as_str().unwrap_or("UTC").to_string(),
        })
    }

    async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), BatteryError> {
        self.call("site.setOperationMode", json!({ "mode": mode.to_string() }))
            .await?;
        Ok(())
    }

    async fn set_backup_reserve(&self, percent: f64) -> Result<(), BatteryError> {
        self.call("site.setBackupReserve", json!({ "percent": percent }))
            .await?;
        Ok(())
    }

    async fn set_export_rule(&self, rule: ExportRule) -> Result<(), BatteryError> {
        self.call("site.setExportRule", json!({ "rule": rule.to_string() }))
            .await?;
        Ok(())
    }

    async fn set_grid_charging(&self, enabled: bool) -> Result<(), BatteryError> {
        self.call("site.setGridCharging", json!({ "enabled": enabled }))
            .await?;
        Ok(())
    }

    async fn get_live_status(&self) -> Result<LiveStatus, BatteryError> {
        let result = self.call("site.liveStatus", json!({})).await?;
        Ok(LiveStatus {
            battery_soc: result["soc"]
                .as_f64()
                .ok_or_else(|| BatteryError::Protocol("liveStatus missing soc".to_string()))?,
            grid_power_w: result["gridPowerW"].as_f64().unwrap_or(0.0),
            solar_power_w: result["solarPowerW"].as_f64().unwrap_or(0.0),
            battery_power_w: result["batteryPowerW"].as_f64().unwrap_or(0.0),
            load_power_w: result["loadPowerW"].as_f64().unwrap_or(0.0),
            captured_at: Utc::now(),
        })
    }
}
