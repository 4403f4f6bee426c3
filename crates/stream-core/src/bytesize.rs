//! Byte sizes with a compact human form (`1B`, `256KB`, `100MB`).

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// A size in bytes. Units are binary: 1KB = 1024B.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const B: ByteSize = ByteSize(1);
    pub const KB: ByteSize = ByteSize(1 << 10);
    pub const MB: ByteSize = ByteSize(1 << 20);
    pub const GB: ByteSize = ByteSize(1 << 30);
    pub const TB: ByteSize = ByteSize(1 << 40);

    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    pub const fn kb(n: u64) -> Self {
        Self(n << 10)
    }

    pub const fn mb(n: u64) -> Self {
        Self(n << 20)
    }

    pub const fn gb(n: u64) -> Self {
        Self(n << 30)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, other: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_sub(other.0))
    }

    /// Scale by `percent / 100`, rounding down.
    pub fn percent(self, percent: u32) -> ByteSize {
        ByteSize((u128::from(self.0) * u128::from(percent) / 100).min(u128::from(u64::MAX)) as u64)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [(1 << 40, "TB"), (1 << 30, "GB"), (1 << 20, "MB"), (1 << 10, "KB")];
        if self.0 > 0 {
            for (unit, suffix) in UNITS {
                if self.0 % unit == 0 {
                    return write!(f, "{}{}", self.0 / unit, suffix);
                }
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl FromStr for ByteSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: "size".to_string(),
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(invalid("invalid syntax"));
        }
        let n: u64 = digits.parse().map_err(|_| invalid("invalid syntax"))?;
        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" => 1 << 10,
            "M" | "MB" => 1 << 20,
            "G" | "GB" => 1 << 30,
            "T" | "TB" => 1 << 40,
            _ => return Err(invalid("invalid syntax")),
        };
        n.checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| invalid("value out of range"))
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for ByteSize {
    fn add_assign(&mut self, rhs: ByteSize) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_largest_exact_unit() {
        assert_eq!(ByteSize(0).to_string(), "0B");
        assert_eq!(ByteSize(1).to_string(), "1B");
        assert_eq!(ByteSize::kb(256).to_string(), "256KB");
        assert_eq!(ByteSize::mb(100).to_string(), "100MB");
        assert_eq!(ByteSize::kb(1200).to_string(), "1200KB");
        assert_eq!(ByteSize(1500).to_string(), "1500B");
    }

    #[test]
    fn parse_units() {
        assert_eq!("100MB".parse::<ByteSize>().unwrap(), ByteSize::mb(100));
        assert_eq!("1kb".parse::<ByteSize>().unwrap(), ByteSize::KB);
        assert_eq!("42".parse::<ByteSize>().unwrap(), ByteSize(42));
        assert!("foo".parse::<ByteSize>().is_err());
        assert!("10XB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn percent_scaling() {
        assert_eq!(ByteSize::mb(300).percent(110), ByteSize(300 * (1 << 20) * 110 / 100));
        assert_eq!(ByteSize(10).percent(100), ByteSize(10));
    }
}
