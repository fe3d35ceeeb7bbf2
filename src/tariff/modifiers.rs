#![allow(dead_code)]
//! Composable tariff modifiers. All of them operate on the builder's
//! working arrays: 48 buy values and 48 sell values in cents/kWh, sell
//! oriented so positive means the consumer earns.
//!
//! Application order is fixed by the builder; each function here touches
//! exactly one concern.

use serde::{Deserialize, Serialize};

use crate::clock::{self, SLOTS_PER_DAY};
use crate::domain::DemandCharge;

/// Replace spike-level buy prices so the battery never mistakes a market
/// spike for a reason to import. The ceiling is inclusive: a price
/// exactly at the ceiling is left unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpikeProtection {
    pub ceiling_cents: f64,
    pub replacement_cents: f64,
}

impl Default for SpikeProtection {
    fn default() -> Self {
        Self { ceiling_cents: 100.0, replacement_cents: 50.0 }
    }
}

/// Shift qualifying sell prices inside a local-time window, nudging the
/// battery's autonomous controller toward discharging there. The window
/// may wrap midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportBoost {
    /// `HH:MM` window edges, half-open.
    pub window_start: String,
    pub window_end: String,
    /// Only sell prices at or above this take the offset.
    pub threshold_cents: f64,
    pub offset_cents: f64,
    pub min_cents: f64,
}

/// Zero out sub-threshold sell prices inside a window, suppressing
/// export when it would not earn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChipMode {
    pub window_start: String,
    pub window_end: String,
    pub threshold_cents: f64,
}

/// Per-period network fee overlay for wholesale-sourced tariffs, with an
/// optional demand-charge header entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkTariff {
    /// Fee added to every buy slot.
    pub base_fee_cents: f64,
    /// Extra fee inside the peak window, when configured.
    #[serde(default)]
    pub peak_window_start: Option<String>,
    #[serde(default)]
    pub peak_window_end: Option<String>,
    #[serde(default)]
    pub peak_fee_cents: f64,
    #[serde(default)]
    pub demand_charges: Vec<DemandCharge>,
}

/// A fixed export schedule from the retailer, applied when the plan's
/// sell side does not follow the dynamic price.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderExportTariff {
    /// `[start, end)` windows with their earnings rate; first hit wins.
    pub windows: Vec<ExportWindow>,
    pub default_cents: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportWindow {
    pub window_start: String,
    pub window_end: String,
    pub cents: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModifierConfig {
    #[serde(default)]
    pub spike_protection: Option<SpikeProtection>,
    #[serde(default)]
    pub export_boost: Option<ExportBoost>,
    #[serde(default)]
    pub chip_mode: Option<ChipMode>,
    #[serde(default)]
    pub network_tariff: Option<NetworkTariff>,
    #[serde(default)]
    pub provider_export: Option<ProviderExportTariff>,
}

fn window_slots(start: &str, end: &str) -> Option<(usize, usize)> {
    Some((clock::parse_slot(start)?, clock::parse_slot(end)?))
}

pub fn apply_spike_protection(buy: &mut [f64; SLOTS_PER_DAY], config: &SpikeProtection) {
    for rate in buy.iter_mut() {
        if *rate > config.ceiling_cents {
            *rate = config.replacement_cents;
        }
    }
}

pub fn apply_export_boost(sell: &mut [f64; SLOTS_PER_DAY], config: &ExportBoost) {
    let Some((start, end)) = window_slots(&config.window_start, &config.window_end) else {
        return;
    };
    for (slot, rate) in sell.iter_mut().enumerate() {
        if clock::slot_in_window(slot, start, end) && *rate >= config.threshold_cents {
            *rate = (*rate + config.offset_cents).max(config.min_cents);
        }
    }
}

pub fn apply_chip_mode(sell: &mut [f64; SLOTS_PER_DAY], config: &ChipMode) {
    let Some((start, end)) = window_slots(&config.window_start, &config.window_end) else {
        return;
    };
    for (slot, rate) in sell.iter_mut().enumerate() {
        if clock::slot_in_window(slot, start, end) && *rate < config.threshold_cents {
            *rate = 0.0;
        }
    }
}

pub fn apply_network_tariff(buy: &mut [f64; SLOTS_PER_DAY], config: &NetworkTariff) {
    let peak = config
        .peak_window_start
        .as_deref()
        .zip(config.peak_window_end.as_deref())
        .and_then(|(s, e)| window_slots(s, e));
    for (slot, rate) in buy.iter_mut().enumerate() {
        *rate += config.base_fee_cents;
        if let Some((start, end)) = peak {
            if clock::slot_in_window(slot, start, end) {
                *rate += config.peak_fee_cents;
            }
        }
    }
}

pub fn apply_provider_export(sell: &mut [f64; SLOTS_PER_DAY], config: &ProviderExportTariff) {
    for (slot, rate) in sell.iter_mut().enumerate() {
        let mut value = config.default_cents;
        for window in &config.windows {
            if let Some((start, end)) = window_slots(&window.window_start, &window.window_end) {
                if clock::slot_in_window(slot, start, end) {
                    value = window.cents;
                    break;
                }
            }
        }
        *rate = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_slot;
    use rstest::rstest;

    fn flat(value: f64) -> [f64; SLOTS_PER_DAY] {
        [value; SLOTS_PER_DAY]
    }

    #[test]
    fn test_spike_protection_cap_is_inclusive() {
        let config = SpikeProtection::default();
        let mut buy = flat(100.0);
        apply_spike_protection(&mut buy, &config);
        // exactly at the ceiling stays
        assert!(buy.iter().all(|r| *r == 100.0));

        let mut buy = flat(100.1);
        apply_spike_protection(&mut buy, &config);
        assert!(buy.iter().all(|r| *r == 50.0));
    }

    #[test]
    fn test_spike_protection_idempotent() {
        let config = SpikeProtection::default();
        let mut buy = flat(250.0);
        apply_spike_protection(&mut buy, &config);
        let once = buy;
        apply_spike_protection(&mut buy, &config);
        assert_eq!(buy, once);
    }

    #[test]
    fn test_export_boost_threshold_and_clamp() {
        let config = ExportBoost {
            window_start: "16:00".to_string(),
            window_end: "20:00".to_string(),
            threshold_cents: 10.0,
            offset_cents: -15.0,
            min_cents: 2.0,
        };
        let mut sell = flat(12.0);
        apply_export_boost(&mut sell, &config);
        let boosted = parse_slot("17:00").unwrap();
        let outside = parse_slot("09:00").unwrap();
        // 12 - 15 clamps to the 2c floor
        assert_eq!(sell[boosted], 2.0);
        assert_eq!(sell[outside], 12.0);
    }

    #[test]
    fn test_export_boost_skips_below_threshold() {
        let config = ExportBoost {
            window_start: "16:00".to_string(),
            window_end: "20:00".to_string(),
            threshold_cents: 10.0,
            offset_cents: 5.0,
            min_cents: 0.0,
        };
        let mut sell = flat(8.0);
        apply_export_boost(&mut sell, &config);
        assert!(sell.iter().all(|r| *r == 8.0));
    }

    #[rstest]
    #[case("22:00", true)]
    #[case("03:00", true)]
    #[case("12:00", false)]
    fn test_export_boost_wraps_midnight(#[case] label: &str, #[case] boosted: bool) {
        let config = ExportBoost {
            window_start: "21:00".to_string(),
            window_end: "10:00".to_string(),
            threshold_cents: 0.0,
            offset_cents: 10.0,
            min_cents: 0.0,
        };
        let mut sell = flat(5.0);
        apply_export_boost(&mut sell, &config);
        let slot = parse_slot(label).unwrap();
        assert_eq!(sell[slot], if boosted { 15.0 } else { 5.0 });
    }

    #[test]
    fn test_export_boost_inverse_round_trip() {
        let forward = ExportBoost {
            window_start: "00:00".to_string(),
            window_end: "23:30".to_string(),
            threshold_cents: 10.0,
            offset_cents: 7.5,
            min_cents: 0.0,
        };
        let original = {
            let mut sell = flat(0.0);
            for (i, rate) in sell.iter_mut().enumerate() {
                *rate = 10.0 + i as f64;
            }
            sell
        };
        let mut sell = original;
        apply_export_boost(&mut sell, &forward);
        // inverse threshold accounts for the shift already applied
        let inverse = ExportBoost {
            threshold_cents: forward.threshold_cents + forward.offset_cents,
            offset_cents: -forward.offset_cents,
            min_cents: 0.0,
            ..forward.clone()
        };
        apply_export_boost(&mut sell, &inverse);
        assert_eq!(sell, original);
    }

    #[test]
    fn test_chip_mode_zeroes_sub_threshold() {
        let config = ChipMode {
            window_start: "10:00".to_string(),
            window_end: "14:00".to_string(),
            threshold_cents: 1.0,
        };
        let mut sell = flat(0.4);
        apply_chip_mode(&mut sell, &config);
        assert_eq!(sell[parse_slot("11:00").unwrap()], 0.0);
        assert_eq!(sell[parse_slot("15:00").unwrap()], 0.4);
    }

    #[test]
    fn test_network_tariff_peak_window() {
        let config = NetworkTariff {
            base_fee_cents: 8.0,
            peak_window_start: Some("15:00".to_string()),
            peak_window_end: Some("21:00".to_string()),
            peak_fee_cents: 12.0,
            demand_charges: vec![],
        };
        let mut buy = flat(20.0);
        apply_network_tariff(&mut buy, &config);
        assert_eq!(buy[parse_slot("10:00").unwrap()], 28.0);
        assert_eq!(buy[parse_slot("18:00").unwrap()], 40.0);
    }

    #[test]
    fn test_provider_export_windows_override_default() {
        let config = ProviderExportTariff {
            windows: vec![ExportWindow {
                window_start: "15:00".to_string(),
                window_end: "21:00".to_string(),
                cents: 10.0,
            }],
            default_cents: 5.0,
        };
        let mut sell = flat(99.0);
        apply_provider_export(&mut sell, &config);
        assert_eq!(sell[parse_slot("18:00").unwrap()], 10.0);
        assert_eq!(sell[parse_slot("08:00").unwrap()], 5.0);
    }
}
