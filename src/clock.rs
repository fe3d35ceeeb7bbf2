#![allow(dead_code)]
use chrono::{DateTime, DurationRound, Timelike, Utc};
use chrono_tz::Tz;

/// Market pricing interval (both the stream and the scheduler align to this).
pub const INTERVAL_MINUTES: u32 = 5;

/// Half-hour tariff slots per day.
pub const SLOTS_PER_DAY: usize = 48;

/// Seconds to wait past the interval boundary before fetching, giving the
/// upstream a moment to publish the interval's price.
pub const BOUNDARY_FETCH_OFFSET_SECS: u64 = 10;

/// Floor a UTC timestamp to its 5-minute sync period. The result is the
/// period's identity.
pub fn period_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = at
        .duration_trunc(chrono::Duration::minutes(INTERVAL_MINUTES as i64))
        .expect("5-minute truncation cannot overflow");
    truncated
}

/// The next 5-minute boundary strictly after `now`.
pub fn next_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    period_start(now) + chrono::Duration::minutes(INTERVAL_MINUTES as i64)
}

/// Seconds until the next stream fetch should start (boundary + offset).
pub fn seconds_until_next_fetch(now: DateTime<Utc>) -> u64 {
    let wait = (next_boundary(now) - now).num_seconds().max(0) as u64;
    wait + BOUNDARY_FETCH_OFFSET_SECS
}

/// Index of the half-hour slot covering a local time, 0 = 00:00, 47 = 23:30.
pub fn slot_index(hour: u32, minute: u32) -> usize {
    (hour as usize) * 2 + if minute >= 30 { 1 } else { 0 }
}

/// The `HH:MM` label of a half-hour slot.
pub fn slot_label(index: usize) -> String {
    let index = index % SLOTS_PER_DAY;
    format!("{:02}:{:02}", index / 2, (index % 2) * 30)
}

/// All 48 period labels in day order.
pub fn all_slot_labels() -> Vec<String> {
    (0..SLOTS_PER_DAY).map(slot_label).collect()
}

/// Slot index for a UTC instant viewed in the site timezone.
pub fn slot_index_in_tz(at: DateTime<Utc>, tz: Tz) -> usize {
    let local = at.with_timezone(&tz);
    slot_index(local.hour(), local.minute())
}

/// Provider day-of-week numbering is Sunday = 0; chrono's
/// `num_days_from_monday` is Monday = 0.
pub fn provider_day_of_week(weekday: chrono::Weekday) -> u8 {
    ((weekday.num_days_from_monday() + 1) % 7) as u8
}

/// Whether a half-hour slot falls inside a `[start, end)` window of slot
/// indices. Windows may wrap midnight (start > end).
pub fn slot_in_window(slot: usize, start: usize, end: usize) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        slot >= start && slot < end
    } else {
        slot >= start || slot < end
    }
}

/// Parse an `HH:MM` window edge into a slot index.
pub fn parse_slot(label: &str) -> Option<usize> {
    let (h, m) = label.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour >= 24 || minute >= 60 {
        return None;
    }
    Some(slot_index(hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_start_floors_to_five_minutes() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 10, 7, 42).unwrap();
        let start = period_start(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn test_next_boundary_rolls_over_hour() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 10, 57, 30).unwrap();
        assert_eq!(
            next_boundary(at),
            Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_fetch_wait_includes_offset() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 10, 4, 0).unwrap();
        assert_eq!(seconds_until_next_fetch(at), 60 + BOUNDARY_FETCH_OFFSET_SECS);
    }

    #[test]
    fn test_slot_labels() {
        assert_eq!(slot_label(0), "00:00");
        assert_eq!(slot_label(1), "00:30");
        assert_eq!(slot_label(47), "23:30");
        assert_eq!(all_slot_labels().len(), 48);
    }

    #[test]
    fn test_slot_index() {
        assert_eq!(slot_index(0, 0), 0);
        assert_eq!(slot_index(0, 29), 0);
        assert_eq!(slot_index(0, 30), 1);
        assert_eq!(slot_index(23, 45), 47);
    }

    #[test]
    fn test_provider_day_of_week_offset() {
        assert_eq!(provider_day_of_week(chrono::Weekday::Sun), 0);
        assert_eq!(provider_day_of_week(chrono::Weekday::Mon), 1);
        assert_eq!(provider_day_of_week(chrono::Weekday::Sat), 6);
    }

    #[test]
    fn test_window_wraps_midnight() {
        // 21:00-10:00 includes 22:00 and 03:00 but not 12:00
        let start = parse_slot("21:00").unwrap();
        let end = parse_slot("10:00").unwrap();
        assert!(slot_in_window(parse_slot("22:00").unwrap(), start, end));
        assert!(slot_in_window(parse_slot("03:00").unwrap(), start, end));
        assert!(!slot_in_window(parse_slot("12:00").unwrap(), start, end));
    }

    #[test]
    fn test_empty_window_matches_nothing() {
        assert!(!slot_in_window(10, 4, 4));
    }
}
