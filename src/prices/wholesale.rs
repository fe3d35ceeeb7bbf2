#![allow(dead_code)]
//! Wholesale market adapter: region-keyed dollars/MWh converted to
//! cents/kWh. Current prices resolve at 5 minutes, settled at 30.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

use super::{PriceSource, SourceError};
use crate::domain::{PriceChannel, PriceKind, PricePoint, PriceSnapshot};

pub fn mwh_dollars_to_kwh_cents(dollars_per_mwh: f64) -> f64 {
    dollars_per_mwh / 10.0
}

pub struct WholesaleSource {
    base_url: String,
    region: String,
    client: reqwest::Client,
}

impl WholesaleSource {
    pub fn new(base_url: impl Into<String>, region: impl Into<String>) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("gridsync/0.3"));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            region: region.into(),
            client,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn fetch(&self, query: &str) -> Result<Vec<RawDispatch>, SourceError> {
        let url = format!("{}/v1/regions/{}/{}", self.base_url, self.region, query);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SourceError::from_status(status, &body));
        }
        serde_json::from_str(&body).map_err(|e| SourceError::Transport(format!("parse: {}", e)))
    }

    fn convert(&self, raw: &RawDispatch, kind: PriceKind, channel: PriceChannel) -> PricePoint {
        let cents = mwh_dollars_to_kwh_cents(raw.dollars_per_mwh);
        let per_kwh_cents = match channel {
            PriceChannel::Import => cents,
            // Exporting earns the wholesale rate, so the pay-to-export
            // figure is its negation.
            PriceChannel::Export => -cents,
        };
        PricePoint {
            start: raw.start_time,
            end: raw.end_time,
            channel,
            per_kwh_cents,
            kind,
            wholesale_cents: Some(cents),
            region: Some(self.region.clone()),
        }
    }

    /// The latest observed wholesale price in cents/kWh; what the spike
    /// manager polls.
    pub async fn current_wholesale_cents(&self) -> Result<f64, SourceError> {
        let snap = self.current().await?;
        snap.import.wholesale_cents.ok_or(SourceError::MissingData)
    }
}

#[async_trait::async_trait]
impl PriceSource for WholesaleSource {
    async fn current(&self) -> Result<PriceSnapshot, SourceError> {
        let raw = self.fetch("dispatch/current").await?;
        let latest = raw
            .iter()
            .max_by_key(|r| r.start_time)
            .ok_or(SourceError::MissingData)?;
        Ok(PriceSnapshot {
            import: self.convert(latest, PriceKind::Current, PriceChannel::Import),
            export: self.convert(latest, PriceKind::Current, PriceChannel::Export),
        })
    }

    async fn forecast(&self, horizon_minutes: i64) -> Result<Vec<PricePoint>, SourceError> {
        let periods = (horizon_minutes / 30).max(1);
        let raw = self.fetch(&format!("predispatch?periods={}", periods)).await?;
        if raw.is_empty() {
            return Err(SourceError::MissingData);
        }
        let mut points = Vec::with_capacity(raw.len() * 2);
        for record in &raw {
            points.push(self.convert(record, PriceKind::Forecast, PriceChannel::Import));
            points.push(self.convert(record, PriceKind::Forecast, PriceChannel::Export));
        }
        Ok(points)
    }

    async fn settled(&self) -> Result<Vec<PricePoint>, SourceError> {
        let raw = self.fetch("settled?periods=4").await?;
        let mut points = Vec::with_capacity(raw.len() * 2);
        for record in &raw {
            points.push(self.convert(record, PriceKind::Settled, PriceChannel::Import));
            points.push(self.convert(record, PriceKind::Settled, PriceChannel::Export));
        }
        Ok(points)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDispatch {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    dollars_per_mwh: f64,
}
