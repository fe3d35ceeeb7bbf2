#![allow(dead_code)]
//! Static TOU rate-card adapter. Synthesizes forecast points by resolving
//! which configured period covers each half hour of the horizon. Carries
//! a small library of preset cards for common plan shapes.

use chrono::{DateTime, Datelike, DurationRound, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{PriceSource, SourceError};
use crate::clock;
use crate::domain::{PriceChannel, PriceKind, PricePoint, PriceSnapshot};

/// One contiguous weekly window. Day-of-week uses provider numbering
/// (0 = Sunday); hours are `[from_hour, to_hour)` with 24 meaning end of
/// day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TouWindow {
    pub from_day_of_week: u8,
    pub to_day_of_week: u8,
    pub from_hour: u32,
    pub to_hour: u32,
}

impl TouWindow {
    pub fn all_week(from_hour: u32, to_hour: u32) -> Self {
        Self { from_day_of_week: 0, to_day_of_week: 6, from_hour, to_hour }
    }

    pub fn weekdays(from_hour: u32, to_hour: u32) -> Self {
        Self { from_day_of_week: 1, to_day_of_week: 5, from_hour, to_hour }
    }

    pub fn contains(&self, day_of_week: u8, hour: u32) -> bool {
        day_of_week >= self.from_day_of_week
            && day_of_week <= self.to_day_of_week
            && hour >= self.from_hour
            && hour < self.to_hour
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatePeriod {
    pub name: String,
    pub rate_dollars: f64,
    pub windows: Vec<TouWindow>,
}

/// A user-configured static TOU plan. Periods are checked in order; the
/// first window hit wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateCard {
    pub name: String,
    pub utility: String,
    pub code: String,
    pub currency: String,
    pub daily_charge: f64,
    pub buy_periods: Vec<RatePeriod>,
    /// Flat feed-in tariff the consumer is paid, $/kWh.
    pub sell_rate_dollars: f64,
}

impl RateCard {
    pub fn buy_rate_at(&self, day_of_week: u8, hour: u32) -> Option<f64> {
        self.buy_periods
            .iter()
            .find(|p| p.windows.iter().any(|w| w.contains(day_of_week, hour)))
            .map(|p| p.rate_dollars)
    }

    pub fn preset(id: &str) -> Option<RateCard> {
        match id {
            "flat_rate" => Some(Self::flat_rate()),
            "simple_tou" => Some(Self::simple_tou()),
            "solar_sponge" => Some(Self::solar_sponge()),
            "ev_friendly" => Some(Self::ev_friendly()),
            _ => None,
        }
    }

    /// Same price all day.
    pub fn flat_rate() -> RateCard {
        RateCard {
            name: "Flat Rate Tariff".to_string(),
            utility: "Generic".to_string(),
            code: "flat_rate".to_string(),
            currency: "AUD".to_string(),
            daily_charge: 1.0,
            buy_periods: vec![RatePeriod {
                name: "ALL".to_string(),
                rate_dollars: 0.30,
                windows: vec![TouWindow::all_week(0, 24)],
            }],
            sell_rate_dollars: 0.05,
        }
    }

    /// Peak 3-9pm weekdays, off-peak otherwise.
    pub fn simple_tou() -> RateCard {
        RateCard {
            name: "Simple Time of Use".to_string(),
            utility: "Generic".to_string(),
            code: "simple_tou".to_string(),
            currency: "AUD".to_string(),
            daily_charge: 1.0,
            buy_periods: vec![
                RatePeriod {
                    name: "PEAK".to_string(),
                    rate_dollars: 0.45,
                    windows: vec![TouWindow::weekdays(15, 21)],
                },
                RatePeriod {
                    name: "OFF_PEAK".to_string(),
                    rate_dollars: 0.15,
                    windows: vec![TouWindow::all_week(0, 24)],
                },
            ],
            sell_rate_dollars: 0.05,
        }
    }

    /// Free daytime period to soak up rooftop solar.
    pub fn solar_sponge() -> RateCard {
        RateCard {
            name: "Solar Sponge (Free Daytime)".to_string(),
            utility: "Generic".to_string(),
            code: "solar_sponge".to_string(),
            currency: "AUD".to_string(),
            daily_charge: 1.0,
            buy_periods: vec![
                RatePeriod {
                    name: "SUPER_OFF_PEAK".to_string(),
                    rate_dollars: 0.0,
                    windows: vec![TouWindow::all_week(9, 15)],
                },
                RatePeriod {
                    name: "PEAK".to_string(),
                    rate_dollars: 0.50,
                    windows: vec![TouWindow::weekdays(15, 21)],
                },
                RatePeriod {
                    name: "OFF_PEAK".to_string(),
                    rate_dollars: 0.20,
                    windows: vec![TouWindow::all_week(0, 24)],
                },
            ],
            sell_rate_dollars: 0.0,
        }
    }

    /// Super cheap overnight rates for EV charging.
    pub fn ev_friendly() -> RateCard {
        RateCard {
            name: "EV Friendly (Cheap Night)".to_string(),
            utility: "Generic".to_string(),
            code: "ev_friendly".to_string(),
            currency: "AUD".to_string(),
            daily_charge: 1.0,
            buy_periods: vec![
                RatePeriod {
                    name: "SUPER_OFF_PEAK".to_string(),
                    rate_dollars: 0.08,
                    windows: vec![TouWindow::all_week(0, 6)],
                },
                RatePeriod {
                    name: "PEAK".to_string(),
                    rate_dollars: 0.45,
                    windows: vec![TouWindow::weekdays(15, 21)],
                },
                RatePeriod {
                    name: "SHOULDER".to_string(),
                    rate_dollars: 0.28,
                    windows: vec![TouWindow::weekdays(6, 15)],
                },
                RatePeriod {
                    name: "OFF_PEAK".to_string(),
                    rate_dollars: 0.18,
                    windows: vec![TouWindow::all_week(0, 24)],
                },
            ],
            sell_rate_dollars: 0.05,
        }
    }
}

pub struct RateCardSource {
    card: RateCard,
    tz: Tz,
}

impl RateCardSource {
    pub fn new(card: RateCard, tz: Tz) -> Self {
        Self { card, tz }
    }

    pub fn card(&self) -> &RateCard {
        &self.card
    }

    fn points_for(&self, start: DateTime<Utc>, end: DateTime<Utc>, kind: PriceKind) -> Option<(PricePoint, PricePoint)> {
        let local = start.with_timezone(&self.tz);
        let dow = clock::provider_day_of_week(local.weekday());
        let buy = self.card.buy_rate_at(dow, local.hour())?;
        let import = PricePoint {
            start,
            end,
            channel: PriceChannel::Import,
            per_kwh_cents: buy * 100.0,
            kind,
            wholesale_cents: None,
            region: None,
        };
        let export = PricePoint {
            start,
            end,
            channel: PriceChannel::Export,
            // The consumer is paid the feed-in rate, so pay-to-export is
            // its negation.
            per_kwh_cents: -(self.card.sell_rate_dollars * 100.0),
            kind,
            wholesale_cents: None,
            region: None,
        };
        Some((import, export))
    }
}

#[async_trait::async_trait]
impl PriceSource for RateCardSource {
    async fn current(&self) -> Result<PriceSnapshot, SourceError> {
        let now = Utc::now();
        let start = now
            .duration_trunc(chrono::Duration::minutes(30))
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let end = start + chrono::Duration::minutes(30);
        let (import, export) = self
            .points_for(start, end, PriceKind::Current)
            .ok_or(SourceError::MissingData)?;
        Ok(PriceSnapshot { import, export })
    }

    async fn forecast(&self, horizon_minutes: i64) -> Result<Vec<PricePoint>, SourceError> {
        let now = Utc::now();
        let first = now
            .duration_trunc(chrono::Duration::minutes(30))
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let slots = (horizon_minutes / 30).max(1);
        let mut points = Vec::with_capacity((slots as usize) * 2);
        for i in 0..slots {
            let start = first + chrono::Duration::minutes(30 * i);
            let end = start + chrono::Duration::minutes(30);
            if let Some((import, export)) = self.points_for(start, end, PriceKind::Forecast) {
                points.push(import);
                points.push(export);
            }
        }
        if points.is_empty() {
            return Err(SourceError::MissingData);
        }
        Ok(points)
    }

    fn is_dynamic(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_matching_period_wins() {
        let card = RateCard::simple_tou();
        // Wednesday 17:00 is peak; provider dow for Wednesday is 3
        assert_eq!(card.buy_rate_at(3, 17), Some(0.45));
        // Wednesday 10:00 falls through to the catch-all
        assert_eq!(card.buy_rate_at(3, 10), Some(0.15));
        // Saturday 17:00 is not a weekday peak
        assert_eq!(card.buy_rate_at(6, 17), Some(0.15));
    }

    #[test]
    fn test_window_hour_bounds_are_half_open() {
        let w = TouWindow::weekdays(15, 21);
        assert!(!w.contains(1, 14));
        assert!(w.contains(1, 15));
        assert!(w.contains(1, 20));
        assert!(!w.contains(1, 21));
    }

    #[test]
    fn test_presets_resolve_by_id() {
        assert!(RateCard::preset("solar_sponge").is_some());
        assert!(RateCard::preset("does_not_exist").is_none());
    }

    #[tokio::test]
    async fn test_forecast_synthesis_covers_horizon() {
        let source = RateCardSource::new(RateCard::flat_rate(), chrono_tz::Australia::Sydney);
        let points = source.forecast(4 * 60).await.unwrap();
        // 8 half-hours, 2 channels each
        assert_eq!(points.len(), 16);
        let import_points: Vec<_> = points
            .iter()
            .filter(|p| p.channel == PriceChannel::Import)
            .collect();
        assert!(import_points.iter().all(|p| p.per_kwh_cents == 30.0));
        let export_points: Vec<_> = points
            .iter()
            .filter(|p| p.channel == PriceChannel::Export)
            .collect();
        assert!(export_points.iter().all(|p| p.per_kwh_cents == -5.0));
    }

    #[test]
    fn test_not_dynamic() {
        let source = RateCardSource::new(RateCard::flat_rate(), chrono_tz::Australia::Sydney);
        assert!(!source.is_dynamic());
    }
}
