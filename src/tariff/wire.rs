#![allow(dead_code)]
//! Translation of the provider-neutral document into the battery
//! vendor's nested tariff JSON.
//!
//! Every half-hour label becomes its own TOU period covering that half
//! hour for all seven days, under a single full-year season. Day-of-week
//! in the wire format counts Sunday as 0.

use serde_json::{json, Map, Value};

use crate::clock::{self, SLOTS_PER_DAY};
use crate::domain::TariffDocument;

pub const SEASON_NAME: &str = "All Year";

/// Build the nested upload payload.
pub fn to_provider_json(doc: &TariffDocument) -> Value {
    let mut buy_rates = Map::new();
    let mut sell_rates = Map::new();
    let mut tou_periods = Map::new();

    for slot in 0..SLOTS_PER_DAY {
        let label = clock::slot_label(slot);
        let (from_hour, from_minute) = ((slot / 2) as u32, ((slot % 2) * 30) as u32);
        let (to_hour, to_minute) = if slot + 1 == SLOTS_PER_DAY {
            (24, 0)
        } else {
            (((slot + 1) / 2) as u32, (((slot + 1) % 2) * 30) as u32)
        };

        buy_rates.insert(label.clone(), json!(doc.buy_rates.get(&label).copied().unwrap_or(0.0)));
        sell_rates.insert(label.clone(), json!(doc.sell_rates.get(&label).copied().unwrap_or(0.0)));
        tou_periods.insert(
            label,
            json!({
                "periods": [{
                    "fromDayOfWeek": 0,
                    "toDayOfWeek": 6,
                    "fromHour": from_hour,
                    "fromMinute": from_minute,
                    "toHour": to_hour,
                    "toMinute": to_minute,
                }]
            }),
        );
    }

    let mut demand_charges = Map::new();
    let mut all_charges = Map::new();
    all_charges.insert("ALL".to_string(), json!(0.0));
    for charge in &doc.metadata.demand_charges {
        all_charges.insert(charge.name.clone(), json!(charge.dollars_per_kw));
    }
    demand_charges.insert("ALL".to_string(), Value::Object(all_charges));

    json!({
        "name": doc.metadata.name,
        "code": doc.metadata.code,
        "utility": doc.metadata.utility,
        "currency": doc.metadata.currency,
        "daily_charges": [{ "name": "Charge", "amount": doc.metadata.daily_charge }],
        "demand_charges": demand_charges,
        "energy_charges": {
            SEASON_NAME: { "rates": buy_rates }
        },
        "sell_tariff": {
            "energy_charges": {
                SEASON_NAME: { "rates": sell_rates }
            }
        },
        "seasons": {
            SEASON_NAME: {
                "fromMonth": 1,
                "toMonth": 12,
                "fromDay": 1,
                "toDay": 31,
                "tou_periods": tou_periods,
            }
        }
    })
}

/// Read a provider payload back into the neutral document, used when
/// snapshotting the battery's current tariff before an override.
pub fn from_provider_json(value: &Value) -> Option<TariffDocument> {
    let metadata = crate::domain::TariffMetadata {
        name: value["name"].as_str()?.to_string(),
        utility: value["utility"].as_str().unwrap_or_default().to_string(),
        code: value["code"].as_str().unwrap_or_default().to_string(),
        currency: value["currency"].as_str().unwrap_or("AUD").to_string(),
        daily_charge: value["daily_charges"][0]["amount"].as_f64().unwrap_or(0.0),
        demand_charges: Vec::new(),
    };
    let buy = value["energy_charges"][SEASON_NAME]["rates"].as_object()?;
    let sell = value["sell_tariff"]["energy_charges"][SEASON_NAME]["rates"].as_object()?;

    let mut doc = TariffDocument {
        metadata,
        buy_rates: Default::default(),
        sell_rates: Default::default(),
    };
    for slot in 0..SLOTS_PER_DAY {
        let label = clock::slot_label(slot);
        doc.buy_rates.insert(label.clone(), buy.get(&label)?.as_f64()?);
        doc.sell_rates.insert(label.clone(), sell.get(&label)?.as_f64()?);
    }
    Some(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DemandCharge, TariffMetadata};

    fn doc() -> TariffDocument {
        TariffDocument::uniform(
            TariffMetadata {
                name: "Dynamic Sync".to_string(),
                utility: "Acme Energy".to_string(),
                code: "DYN".to_string(),
                currency: "AUD".to_string(),
                daily_charge: 1.1,
                demand_charges: vec![DemandCharge {
                    name: "Peak Demand".to_string(),
                    dollars_per_kw: 12.5,
                    window_start: None,
                    window_end: None,
                }],
            },
            0.25,
            0.08,
        )
    }

    #[test]
    fn test_payload_shape() {
        let payload = to_provider_json(&doc());
        assert_eq!(payload["energy_charges"][SEASON_NAME]["rates"]["10:00"], 0.25);
        assert_eq!(
            payload["sell_tariff"]["energy_charges"][SEASON_NAME]["rates"]["23:30"],
            0.08
        );
        assert_eq!(payload["seasons"][SEASON_NAME]["fromMonth"], 1);
        assert_eq!(payload["demand_charges"]["ALL"]["Peak Demand"], 12.5);
    }

    #[test]
    fn test_tou_periods_cover_whole_week() {
        let payload = to_provider_json(&doc());
        let period = &payload["seasons"][SEASON_NAME]["tou_periods"]["13:30"]["periods"][0];
        assert_eq!(period["fromDayOfWeek"], 0);
        assert_eq!(period["toDayOfWeek"], 6);
        assert_eq!(period["fromHour"], 13);
        assert_eq!(period["fromMinute"], 30);
        assert_eq!(period["toHour"], 14);
        assert_eq!(period["toMinute"], 0);
    }

    #[test]
    fn test_last_slot_runs_to_end_of_day() {
        let payload = to_provider_json(&doc());
        let period = &payload["seasons"][SEASON_NAME]["tou_periods"]["23:30"]["periods"][0];
        assert_eq!(period["toHour"], 24);
        assert_eq!(period["toMinute"], 0);
    }

    #[test]
    fn test_wire_round_trip() {
        let original = doc();
        let payload = to_provider_json(&original);
        let parsed = from_provider_json(&payload).unwrap();
        assert_eq!(parsed.buy_rates, original.buy_rates);
        assert_eq!(parsed.sell_rates, original.sell_rates);
        assert_eq!(parsed.metadata.name, original.metadata.name);
    }
}
