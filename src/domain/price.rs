#![allow(dead_code)]
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of energy flow measured against the consumer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PriceChannel {
    /// Consumer buys from the grid.
    Import,
    /// Consumer sells to the grid.
    Export,
}

impl std::str::FromStr for PriceChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "import" | "general" | "buy" => Ok(PriceChannel::Import),
            "export" | "feedin" | "feed_in" | "sell" => Ok(PriceChannel::Export),
            _ => Err(format!("Unknown price channel: {}", s)),
        }
    }
}

impl std::fmt::Display for PriceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceChannel::Import => write!(f, "import"),
            PriceChannel::Export => write!(f, "export"),
        }
    }
}

/// How firm a price record is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PriceKind {
    /// Finalized by the market operator.
    Settled,
    /// The streamed price for the interval in progress.
    Current,
    Forecast,
}

impl PriceKind {
    /// Precedence when several records land in the same tariff slot.
    /// Settled displaces current displaces forecast.
    pub fn precedence(self) -> u8 {
        match self {
            PriceKind::Settled => 2,
            PriceKind::Current => 1,
            PriceKind::Forecast => 0,
        }
    }
}

/// A half-open interval price record. Per-kWh values are signed cents:
/// positive import means the consumer pays, negative export means the
/// consumer is paid to export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricePoint {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub channel: PriceChannel,
    pub per_kwh_cents: f64,
    pub kind: PriceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wholesale_cents: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl PricePoint {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// What the consumer earns per kWh exported. The provider convention
    /// is pay-to-export positive, so earnings flip the sign.
    pub fn export_earnings_cents(&self) -> f64 {
        debug_assert_eq!(self.channel, PriceChannel::Export);
        -self.per_kwh_cents
    }
}

/// The most recent known price for the current interval, both channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceSnapshot {
    pub import: PricePoint,
    pub export: PricePoint,
}

impl PriceSnapshot {
    /// Interval start shared by both channels.
    pub fn interval_start(&self) -> DateTime<Utc> {
        self.import.start
    }

    /// Whether either channel moved by more than `threshold_cents`
    /// against a previously synced pair of (import, export) cent values.
    pub fn differs_from(&self, last: (f64, f64), threshold_cents: f64) -> bool {
        (self.import.per_kwh_cents - last.0).abs() > threshold_cents
            || (self.export.per_kwh_cents - last.1).abs() > threshold_cents
    }

    pub fn cents_pair(&self) -> (f64, f64) {
        (self.import.per_kwh_cents, self.export.per_kwh_cents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(channel: PriceChannel, cents: f64) -> PricePoint {
        PricePoint {
            start: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 1, 10, 5, 0).unwrap(),
            channel,
            per_kwh_cents: cents,
            kind: PriceKind::Current,
            wholesale_cents: None,
            region: None,
        }
    }

    #[test]
    fn test_channel_from_str_accepts_wire_names() {
        assert_eq!("general".parse::<PriceChannel>().unwrap(), PriceChannel::Import);
        assert_eq!("feedIn".parse::<PriceChannel>().unwrap(), PriceChannel::Export);
        assert!("both".parse::<PriceChannel>().is_err());
    }

    #[test]
    fn test_kind_precedence_ordering() {
        assert!(PriceKind::Settled.precedence() > PriceKind::Current.precedence());
        assert!(PriceKind::Current.precedence() > PriceKind::Forecast.precedence());
    }

    #[test]
    fn test_export_earnings_flips_sign() {
        // Negative feed-in price means the consumer is paid
        let p = point(PriceChannel::Export, -8.0);
        assert_eq!(p.export_earnings_cents(), 8.0);
    }

    #[test]
    fn test_snapshot_delta_threshold() {
        let snap = PriceSnapshot {
            import: point(PriceChannel::Import, 25.3),
            export: point(PriceChannel::Export, -8.2),
        };
        // 0.3c / 0.2c moves stay under the 0.5c gate
        assert!(!snap.differs_from((25.0, -8.0), 0.5));
        // 2.0c import move crosses it
        let snap2 = PriceSnapshot {
            import: point(PriceChannel::Import, 27.0),
            export: point(PriceChannel::Export, -8.0),
        };
        assert!(snap2.differs_from((25.0, -8.0), 0.5));
    }
}
