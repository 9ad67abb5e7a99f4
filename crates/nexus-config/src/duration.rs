//! Serde helpers for duration-valued options.
//!
//! Durations are accepted either as plain seconds (`30`, `2.5`) or as
//! humantime strings (`"30s"`, `"5m"`, `"250ms"`), and always written back
//! in humantime form.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(f64),
    Text(String),
}

pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => seconds_to_duration(secs).map_err(D::Error::custom),
        RawDuration::Text(text) => parse(&text).map_err(D::Error::custom),
    }
}

/// Parse a duration from a humantime string or a bare number of seconds.
pub fn parse(text: &str) -> Result<Duration, String> {
    let trimmed = text.trim();
    if let Ok(secs) = trimmed.parse::<f64>() {
        return seconds_to_duration(secs);
    }
    humantime::parse_duration(trimmed).map_err(|e| format!("invalid duration '{}': {}", text, e))
}

fn seconds_to_duration(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration {}: must be a finite, non-negative number of seconds", secs));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("invalid duration {}: {}", secs, e))
}
