//! Compact duration strings (`5ms`, `30s`, `1m30s`, `3h`) for config files.

use std::time::Duration;

use crate::error::ConfigError;

/// Parse a duration written as a sequence of `<number><unit>` parts.
pub fn parse(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: "duration".to_string(),
        value: value.to_string(),
        reason: "invalid syntax".to_string(),
    };

    let mut rest = value.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits_end == 0 {
            return Err(invalid());
        }
        let n: u64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        rest = &rest[digits_end..];
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_end] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n * 60),
            "h" => Duration::from_secs(n * 3600),
            _ => return Err(invalid()),
        };
        total += part;
        rest = &rest[unit_end..];
    }
    Ok(total)
}

/// Format a duration in the same compact form accepted by [`parse`].
pub fn format(d: Duration) -> String {
    let millis = d.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let mut secs = d.as_secs();
    let mut out = String::new();
    for (unit, suffix) in [(3600, "h"), (60, "m"), (1, "s")] {
        if secs >= unit {
            out.push_str(&format!("{}{}", secs / unit, suffix));
            secs %= unit;
        }
    }
    out
}

/// `#[serde(with = "stream_core::duration::serde_str")]` adapter.
pub mod serde_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_and_compound() {
        assert_eq!(parse("5ms").unwrap(), Duration::from_millis(5));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse("3h").unwrap(), Duration::from_secs(3 * 3600));
    }

    #[test]
    fn parse_rejects_invalid() {
        assert!(parse("").is_err());
        assert!(parse("10").is_err());
        assert!(parse("s").is_err());
        assert!(parse("10d").is_err());
    }

    #[test]
    fn format_matches_parse() {
        for d in [
            Duration::from_millis(5),
            Duration::from_secs(30),
            Duration::from_secs(90),
            Duration::from_secs(3 * 3600),
        ] {
            assert_eq!(parse(&format(d)).unwrap(), d);
        }
        assert_eq!(format(Duration::from_secs(90)), "1m30s");
    }
}
