//! Parsers for human-readable sizes, durations and rate limits.
//!
//! Configuration keeps these as strings ("10MB", "40m", "200/minute") so the
//! file stays editable by hand. They are parsed exactly once, when the
//! effective settings are resolved.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::ConfigError;

/// A rate limit normalised to "`count` events per `per`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateSpec {
    pub count: u32,
    #[serde(with = "duration_secs")]
    pub per: Duration,
}

impl RateSpec {
    pub fn new(count: u32, per: Duration) -> Self {
        Self { count, per }
    }

    /// Events admitted per second.
    pub fn per_second(&self) -> f64 {
        self.count as f64 / self.per.as_secs_f64()
    }

    /// Parse a rate such as `200/minute`, `10/second` or `10/5s`.
    ///
    /// Returns `Ok(None)` for an empty string, meaning "unlimited".
    pub fn parse(raw: &str) -> Result<Option<Self>, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let invalid = || ConfigError::InvalidRateLimit(raw.to_string());

        let (count, unit) = raw.split_once('/').ok_or_else(invalid)?;
        let count: u32 = count.trim().parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }

        let unit = unit.trim().to_ascii_lowercase();
        let per = match unit.as_str() {
            "s" | "sec" | "second" | "seconds" => Duration::from_secs(1),
            "m" | "min" | "minute" | "minutes" => Duration::from_secs(60),
            "h" | "hour" | "hours" => Duration::from_secs(3600),
            "d" | "day" | "days" => Duration::from_secs(86_400),
            other => parse_duration(other).map_err(|_| invalid())?,
        };
        if per.is_zero() {
            return Err(invalid());
        }

        Ok(Some(Self { count, per }))
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.per.as_secs() {
            1 if self.per.subsec_nanos() == 0 => write!(f, "{}/second", self.count),
            60 if self.per.subsec_nanos() == 0 => write!(f, "{}/minute", self.count),
            3600 if self.per.subsec_nanos() == 0 => write!(f, "{}/hour", self.count),
            86_400 if self.per.subsec_nanos() == 0 => write!(f, "{}/day", self.count),
            _ => write!(f, "{}/{}s", self.count, self.per.as_secs_f64()),
        }
    }
}

/// Parse a duration such as `15s`, `40m`, `3d`, `1h30m` or `500ms`.
///
/// A bare number is interpreted as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    if raw.is_empty() {
        return Err(invalid());
    }

    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let seconds = match unit.to_ascii_lowercase().as_str() {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            "d" => value * 86_400.0,
            "w" => value * 604_800.0,
            _ => return Err(invalid()),
        };
        let part = Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}

/// Parse an optional duration: an empty string yields `None`.
pub fn parse_optional_duration(raw: &str) -> Result<Option<Duration>, ConfigError> {
    if raw.trim().is_empty() {
        Ok(None)
    } else {
        parse_duration(raw).map(Some)
    }
}

/// Parse a byte size such as `10MB`, `1.5GB` or `512`.
///
/// Units are binary multiples. An empty string or `0` yields 0, which the
/// file filter treats as "no bound".
pub fn parse_size(raw: &str) -> Result<u64, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    let invalid = || ConfigError::InvalidSize(raw.to_string());

    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let value: f64 = raw[..split].parse().map_err(|_| invalid())?;
    let multiplier: u64 = match raw[split..].trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(invalid()),
    };

    Ok((value * multiplier as f64) as u64)
}

pub(crate) mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
