#![allow(dead_code)]
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock;

/// Bounds for a single period rate, in dollars/kWh (the -200..2500 cent
/// range the providers accept).
pub const MIN_RATE_DOLLARS: f64 = -2.0;
pub const MAX_RATE_DOLLARS: f64 = 25.0;

#[derive(Debug, Error)]
pub enum TariffError {
    #[error("Period label {0} missing from {1} schedule")]
    MissingPeriod(String, &'static str),
    #[error("Unexpected period label {0} in {1} schedule")]
    UnknownPeriod(String, &'static str),
    #[error("Rate {rate} for {label} ({side}) outside [{MIN_RATE_DOLLARS}, {MAX_RATE_DOLLARS}] $/kWh")]
    RateOutOfBounds { label: String, side: &'static str, rate: f64 },
}

/// A monthly demand charge overlay carried in the document header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemandCharge {
    pub name: String,
    pub dollars_per_kw: f64,
    /// `HH:MM` window the charge applies to; whole day when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TariffMetadata {
    pub name: String,
    pub utility: String,
    pub code: String,
    pub currency: String,
    pub daily_charge: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub demand_charges: Vec<DemandCharge>,
}

/// Provider-neutral daily tariff: one buy and one sell rate (dollars/kWh)
/// for each of the 48 half-hour period labels. This is the unit of upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TariffDocument {
    pub metadata: TariffMetadata,
    /// `HH:MM` label -> $/kWh the consumer pays to import.
    pub buy_rates: BTreeMap<String, f64>,
    /// `HH:MM` label -> $/kWh the consumer is paid to export.
    pub sell_rates: BTreeMap<String, f64>,
}

impl TariffDocument {
    /// A document with the same rate in every slot on both sides.
    pub fn uniform(metadata: TariffMetadata, buy_dollars: f64, sell_dollars: f64) -> Self {
        let mut buy_rates = BTreeMap::new();
        let mut sell_rates = BTreeMap::new();
        for label in clock::all_slot_labels() {
            buy_rates.insert(label.clone(), buy_dollars);
            sell_rates.insert(label, sell_dollars);
        }
        Self { metadata, buy_rates, sell_rates }
    }

    /// Every period label present exactly once on both sides, all rates
    /// within provider bounds.
    pub fn validate(&self) -> Result<(), TariffError> {
        let sides: [(&'static str, &BTreeMap<String, f64>); 2] =
            [("buy", &self.buy_rates), ("sell", &self.sell_rates)];
        for (side, rates) in sides {
            for label in clock::all_slot_labels() {
                match rates.get(&label) {
                    None => return Err(TariffError::MissingPeriod(label, side)),
                    Some(rate) if !(MIN_RATE_DOLLARS..=MAX_RATE_DOLLARS).contains(rate) => {
                        return Err(TariffError::RateOutOfBounds {
                            label,
                            side,
                            rate: *rate,
                        })
                    }
                    Some(_) => {}
                }
            }
            if rates.len() != clock::SLOTS_PER_DAY {
                let extra = rates
                    .keys()
                    .find(|k| clock::parse_slot(k).is_none())
                    .cloned()
                    .unwrap_or_default();
                return Err(TariffError::UnknownPeriod(extra, side));
            }
        }
        Ok(())
    }

    pub fn buy_rate(&self, label: &str) -> Option<f64> {
        self.buy_rates.get(label).copied()
    }

    pub fn sell_rate(&self, label: &str) -> Option<f64> {
        self.sell_rates.get(label).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TariffMetadata {
        TariffMetadata {
            name: "Dynamic".to_string(),
            utility: "Acme Energy".to_string(),
            code: "DYN-1".to_string(),
            currency: "AUD".to_string(),
            daily_charge: 1.1,
            demand_charges: vec![],
        }
    }

    #[test]
    fn test_uniform_document_is_valid() {
        let doc = TariffDocument::uniform(meta(), 0.25, 0.08);
        doc.validate().unwrap();
        assert_eq!(doc.buy_rates.len(), 48);
        assert_eq!(doc.sell_rates.len(), 48);
        assert_eq!(doc.buy_rate("10:00"), Some(0.25));
    }

    #[test]
    fn test_missing_period_rejected() {
        let mut doc = TariffDocument::uniform(meta(), 0.25, 0.08);
        doc.sell_rates.remove("13:30");
        assert!(matches!(
            doc.validate(),
            Err(TariffError::MissingPeriod(label, "sell")) if label == "13:30"
        ));
    }

    #[test]
    fn test_rate_bounds_enforced() {
        let mut doc = TariffDocument::uniform(meta(), 0.25, 0.08);
        doc.buy_rates.insert("10:00".to_string(), 26.0);
        assert!(matches!(doc.validate(), Err(TariffError::RateOutOfBounds { .. })));
    }

    #[test]
    fn test_extra_label_rejected() {
        let mut doc = TariffDocument::uniform(meta(), 0.25, 0.08);
        doc.buy_rates.insert("24:00".to_string(), 0.1);
        assert!(matches!(doc.validate(), Err(TariffError::UnknownPeriod(..))));
    }
}
