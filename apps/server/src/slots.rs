//! The fixed daily slot grid.
//!
//! Every bookable slot is one hour long and starts on the hour between
//! `OPEN_HOUR` and `CLOSE_HOUR`; plan duration does not change slot width.

use chrono::{NaiveTime, Timelike};

/// First slot start (11:00).
pub const OPEN_HOUR: u32 = 11;
/// Closing hour; the last slot starts one hour earlier (20:00).
pub const CLOSE_HOUR: u32 = 21;

/// All slot start times for a day, "HH:MM", ascending.
pub fn grid() -> Vec<String> {
    (OPEN_HOUR..CLOSE_HOUR).map(|h| format!("{:02}:00", h)).collect()
}

/// Parse "H:MM" / "HH:MM" into a zero-padded "HH:MM".
pub fn normalize_time(time: &str) -> Option<String> {
    let t = NaiveTime::parse_from_str(time.trim(), "%H:%M").ok()?;
    Some(format!("{:02}:{:02}", t.hour(), t.minute()))
}

/// True when `time` is exactly one of the grid's slot starts.
pub fn is_grid_slot(time: &str) -> bool {
    match normalize_time(time) {
        Some(t) => grid().contains(&t),
        None => false,
    }
}

/// End of the one-hour slot starting at `start`: start hour + 1, on the hour.
pub fn slot_end(start: &str) -> Option<String> {
    let t = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
    let hour = t.hour() + 1;
    if hour > 24 {
        return None;
    }
    Some(format!("{:02}:00", hour))
}
