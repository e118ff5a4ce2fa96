//! CLI argument validators.
//!
//! Shared validation functions for CLI argument parsing.

use crate::constants::workers::MAX_COUNT;
use std::time::Duration;

/// Parse and validate a score or confidence value (0.0-1.0).
pub fn parse_confidence(s: &str) -> Result<f32, String> {
    let value: f32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;

    if !(0.0..=1.0).contains(&value) {
        return Err(format!("value must be between 0.0 and 1.0, got {value}"));
    }

    Ok(value)
}

/// Parse and validate a worker count (1 to the configured maximum).
pub fn parse_workers(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid count"))?;

    if !(1..=MAX_COUNT).contains(&value) {
        return Err(format!("workers must be between 1 and {MAX_COUNT}, got {value}"));
    }

    Ok(value)
}

/// Parse a duration such as `90s`, `30m`, `1h` or `2d`. A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("'{s}' is not a valid duration"))?;
    let seconds = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return Err(format!("unknown duration unit '{unit}' (use s, m, h or d)")),
    };

    Ok(Duration::from_secs(value.saturating_mul(seconds)))
}
