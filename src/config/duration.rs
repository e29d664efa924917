//! Duration fields in config files
//!
//! Accepts humantime strings (`500ms`, `1m30s`), fractional values with a unit
//! (`0.5s`, `1.5m`) and bare numbers meaning seconds. Use with
//! `#[serde(with = "crate::config::duration")]`.

use serde::{de, Deserializer, Serializer};
use std::fmt;
use std::time::Duration;

/// Parse a duration string
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use loadtool::config::duration::parse_duration;
///
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(secs) = s.parse::<f64>() {
        return secs_to_duration(secs);
    }

    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Fractional value with a single unit, e.g. "0.5s"
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("invalid duration: {:?}", s))?;
    let (value, unit) = s.split_at(split);
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", s))?;
    let scale = match unit.trim() {
        "ns" => 1e-9,
        "us" | "µs" => 1e-6,
        "ms" => 1e-3,
        "s" | "sec" => 1.0,
        "m" | "min" => 60.0,
        "h" => 3600.0,
        other => return Err(format!("unknown duration unit {:?} in {:?}", other, s)),
    };
    secs_to_duration(value * scale)
}

fn secs_to_duration(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("duration must be a non-negative number, got {}", secs));
    }
    Ok(Duration::from_secs_f64(secs))
}

pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*d).to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> de::Visitor<'de> for V {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("duration as string (e.g. 10s, 0.5s), integer seconds, or float seconds")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            secs_to_duration(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(V)
}

/// Same as the parent module for `Option<Duration>` fields
pub mod option {
    use super::*;

    pub fn serialize<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match d {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        super::deserialize(deserializer).map(Some)
    }
}
