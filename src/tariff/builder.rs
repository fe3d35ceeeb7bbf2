#![allow(dead_code)]
//! Forecast series -> 48-period tariff document. Pure construction, no
//! I/O: everything the transform needs arrives in [`TransformInput`].
//!
//! Working orientation: buy values are cents the consumer pays to
//! import; sell values are cents the consumer earns per kWh exported
//! (the negation of the pay-to-export price the sources carry).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use super::modifiers::{self, ModifierConfig};
use crate::clock::{self, SLOTS_PER_DAY};
use crate::domain::{
    PriceChannel, PricePoint, PriceSnapshot, TariffDocument, TariffMetadata,
};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Forecast series has no usable points")]
    EmptyForecast,
}

pub struct TransformInput<'a> {
    pub forecast: &'a [PricePoint],
    /// The streamed price for the interval in progress; displaces the
    /// forecast for its slot.
    pub current_interval: Option<&'a PriceSnapshot>,
    pub timezone: Tz,
    pub modifiers: &'a ModifierConfig,
    pub metadata: TariffMetadata,
    /// Network overlays only apply to wholesale-sourced series.
    pub source_is_wholesale: bool,
}

#[derive(Clone, Copy)]
struct SlotValue {
    cents: f64,
    precedence: u8,
    start: DateTime<Utc>,
}

/// Orient a source price into the working arrays' convention.
fn oriented_cents(point: &PricePoint) -> f64 {
    match point.channel {
        PriceChannel::Import => point.per_kwh_cents,
        PriceChannel::Export => -point.per_kwh_cents,
    }
}

fn place(
    slots: &mut [Option<SlotValue>; SLOTS_PER_DAY],
    slot: usize,
    candidate: SlotValue,
) {
    match slots[slot] {
        Some(existing)
            if candidate.precedence < existing.precedence
                || (candidate.precedence == existing.precedence
                    && candidate.start < existing.start) => {}
        _ => slots[slot] = Some(candidate),
    }
}

fn round4(dollars: f64) -> f64 {
    (dollars * 10_000.0).round() / 10_000.0
}

pub fn build(input: TransformInput<'_>) -> Result<TariffDocument, TransformError> {
    let mut buy_slots: [Option<SlotValue>; SLOTS_PER_DAY] = [None; SLOTS_PER_DAY];
    let mut sell_slots: [Option<SlotValue>; SLOTS_PER_DAY] = [None; SLOTS_PER_DAY];

    // 1. Assign forecast points to their local half-hour slots, with
    //    settled > current > forecast precedence, later start winning ties.
    for point in input.forecast {
        let slot = clock::slot_index_in_tz(point.start, input.timezone);
        let value = SlotValue {
            cents: oriented_cents(point),
            precedence: point.kind.precedence(),
            start: point.start,
        };
        match point.channel {
            PriceChannel::Import => place(&mut buy_slots, slot, value),
            PriceChannel::Export => place(&mut sell_slots, slot, value),
        }
    }

    // 2. Overlay the streamed current-interval price onto the present slot.
    if let Some(current) = input.current_interval {
        for point in [&current.import, &current.export] {
            let slot = clock::slot_index_in_tz(point.start, input.timezone);
            let value = SlotValue {
                cents: oriented_cents(point),
                precedence: u8::MAX,
                start: point.start,
            };
            match point.channel {
                PriceChannel::Import => place(&mut buy_slots, slot, value),
                PriceChannel::Export => place(&mut sell_slots, slot, value),
            }
        }
    }

    // 3. Forward-fill uncovered slots from the previous value; leading
    //    gaps take the first known value.
    let mut buy = fill(&buy_slots).ok_or(TransformError::EmptyForecast)?;
    let mut sell = fill(&sell_slots).ok_or(TransformError::EmptyForecast)?;

    // 4. Modifiers, fixed order.
    let m = input.modifiers;
    if let Some(config) = &m.spike_protection {
        modifiers::apply_spike_protection(&mut buy, config);
    }
    if let Some(config) = &m.export_boost {
        modifiers::apply_export_boost(&mut sell, config);
    }
    if let Some(config) = &m.chip_mode {
        modifiers::apply_chip_mode(&mut sell, config);
    }
    let mut metadata = input.metadata;
    if input.source_is_wholesale {
        if let Some(config) = &m.network_tariff {
            modifiers::apply_network_tariff(&mut buy, config);
            metadata.demand_charges = config.demand_charges.clone();
        }
    }
    if let Some(config) = &m.provider_export {
        modifiers::apply_provider_export(&mut sell, config);
    }

    // 5. Cents -> dollars, 4 decimal places, 48 labeled slots.
    let mut doc = TariffDocument {
        metadata,
        buy_rates: Default::default(),
        sell_rates: Default::default(),
    };
    for slot in 0..SLOTS_PER_DAY {
        let label = clock::slot_label(slot);
        doc.buy_rates.insert(label.clone(), round4(buy[slot] / 100.0));
        doc.sell_rates.insert(label, round4(sell[slot] / 100.0));
    }
    Ok(doc)
}

fn fill(slots: &[Option<SlotValue>; SLOTS_PER_DAY]) -> Option<[f64; SLOTS_PER_DAY]> {
    let first_known = slots.iter().flatten().next()?.cents;
    let mut out = [0.0; SLOTS_PER_DAY];
    let mut previous = first_known;
    for (i, slot) in slots.iter().enumerate() {
        if let Some(value) = slot {
            previous = value.cents;
        }
        out[i] = previous;
    }
    Some(out)
}
