#![allow(dead_code)]
//! Retailer REST adapter: per-channel forecast and settled prices at
//! 30-minute granularity, with selectable forecast uncertainty class.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

use super::{PriceSource, SourceError, TokenProvider};
use crate::domain::{PriceChannel, PriceKind, PricePoint, PriceSnapshot};

/// Which forecast class the retailer's advanced price model feeds into
/// the tariff. `Predicted` is the provider's central estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastClass {
    Predicted,
    Low,
    High,
}

impl Default for ForecastClass {
    fn default() -> Self {
        ForecastClass::Predicted
    }
}

pub struct RetailerSource {
    base_url: String,
    site_id: String,
    token: TokenProvider,
    forecast_class: ForecastClass,
    client: reqwest::Client,
}

impl RetailerSource {
    pub fn new(
        base_url: impl Into<String>,
        site_id: impl Into<String>,
        token: TokenProvider,
        forecast_class: ForecastClass,
    ) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("gridsync/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            site_id: site_id.into(),
            token,
            forecast_class,
            client,
        })
    }

    async fn fetch_prices(&self, path_and_query: &str) -> Result<Vec<RawPrice>, SourceError> {
        let url = format!("{}/v1/sites/{}/{}", self.base_url, self.site_id, path_and_query);
        let resp = self
            .client
            .get(&url)
            .bearer_auth((self.token)())
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SourceError::from_status(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| SourceError::Transport(format!("parse: {}", e)))
    }

    fn convert(&self, raw: RawPrice) -> Option<PricePoint> {
        let channel: PriceChannel = raw.channel_type.parse().ok()?;
        let kind = match raw.kind.as_str() {
            "ActualInterval" => PriceKind::Settled,
            "CurrentInterval" => PriceKind::Current,
            "ForecastInterval" => PriceKind::Forecast,
            _ => return None,
        };
        let per_kwh = if kind == PriceKind::Forecast {
            match (&raw.advanced_price, self.forecast_class) {
                (Some(adv), ForecastClass::Predicted) => adv.predicted,
                (Some(adv), ForecastClass::Low) => adv.low,
                (Some(adv), ForecastClass::High) => adv.high,
                (None, _) => raw.per_kwh,
            }
        } else {
            raw.per_kwh
        };
        Some(PricePoint {
            start: raw.start_time,
            end: raw.end_time,
            channel,
            per_kwh_cents: per_kwh,
            kind,
            wholesale_cents: raw.spot_per_kwh,
            region: None,
        })
    }

    fn into_snapshot(points: Vec<PricePoint>) -> Result<PriceSnapshot, SourceError> {
        let import = points
            .iter()
            .find(|p| p.channel == PriceChannel::Import)
            .cloned();
        let export = points
            .iter()
            .find(|p| p.channel == PriceChannel::Export)
            .cloned();
        match (import, export) {
            (Some(import), Some(export)) => Ok(PriceSnapshot { import, export }),
            _ => Err(SourceError::MissingData),
        }
    }
}

#[async_trait::async_trait]
impl PriceSource for RetailerSource {
    async fn current(&self) -> Result<PriceSnapshot, SourceError> {
        let raw = self.fetch_prices("prices/current?resolution=30").await?;
        let points: Vec<PricePoint> = raw.into_iter().filter_map(|r| self.convert(r)).collect();
        Self::into_snapshot(points)
    }

    async fn forecast(&self, horizon_minutes: i64) -> Result<Vec<PricePoint>, SourceError> {
        let periods = (horizon_minutes / 30).max(1);
        let raw = self
            .fetch_prices(&format!("prices/forecast?resolution=30&next={}", periods))
            .await?;
        let points: Vec<PricePoint> = raw.into_iter().filter_map(|r| self.convert(r)).collect();
        if points.is_empty() {
            return Err(SourceError::MissingData);
        }
        Ok(points)
    }

    async fn settled(&self) -> Result<Vec<PricePoint>, SourceError> {
        let raw = self.fetch_prices("prices?resolution=30&previous=4").await?;
        Ok(raw
            .into_iter()
            .filter_map(|r| self.convert(r))
            .filter(|p| p.kind == PriceKind::Settled)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPrice {
    #[serde(rename = "type")]
    kind: String,
    per_kwh: f64,
    #[serde(default)]
    spot_per_kwh: Option<f64>,
    channel_type: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default)]
    advanced_price: Option<AdvancedPrice>,
}

#[derive(Debug, Deserialize)]
struct AdvancedPrice {
    low: f64,
    predicted: f64,
    high: f64,
}
