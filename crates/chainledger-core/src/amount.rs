//! Fixed-point amounts in the chain's smallest unit.
//!
//! Peers report values in different shapes: Bitcoin-family nodes return
//! decimal coin amounts (`0.5`), EVM nodes return hex-encoded wei. Both are
//! normalised into an exact integer count of base units so that balance
//! arithmetic never goes through floating point.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LedgerError;

/// An unsigned amount in base units (satoshi, wei, token units).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn new(units: u128) -> Self {
        Self(units)
    }

    pub fn units(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse a decimal coin amount (`"0.5"`, `"1e-8"`) into base units.
    ///
    /// Digits beyond `decimals` places are rejected rather than rounded.
    pub fn from_decimal_str(s: &str, decimals: u32) -> Result<Self, LedgerError> {
        let s = s.trim();
        let bad = || LedgerError::Decode(format!("invalid decimal amount '{s}'"));
        if s.is_empty() || s.starts_with('-') {
            return Err(bad());
        }

        let (mantissa, exponent) = match s.find(['e', 'E']) {
            Some(pos) => {
                let exp: i32 = s[pos + 1..].parse().map_err(|_| bad())?;
                (&s[..pos], exp)
            }
            None => (s, 0),
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
            || (int_part.is_empty() && frac_part.is_empty())
        {
            return Err(bad());
        }

        // Shift the decimal point: value = digits * 10^(scale) where
        // scale = decimals + exponent - len(frac).
        let digits = format!("{int_part}{frac_part}");
        let digits = digits.trim_start_matches('0');
        let scale = decimals as i64 + exponent as i64 - frac_part.len() as i64;

        if digits.is_empty() {
            return Ok(Self::ZERO);
        }

        let (kept, shift) = if scale >= 0 {
            (digits.to_string(), scale as u32)
        } else {
            let drop = (-scale) as usize;
            if drop >= digits.len() {
                return Err(LedgerError::Decode(format!(
                    "amount '{s}' has more than {decimals} decimal places"
                )));
            }
            let (head, tail) = digits.split_at(digits.len() - drop);
            if tail.chars().any(|c| c != '0') {
                return Err(LedgerError::Decode(format!(
                    "amount '{s}' has more than {decimals} decimal places"
                )));
            }
            (head.to_string(), 0)
        };

        let base: u128 = kept.parse().map_err(|_| bad())?;
        10u128
            .checked_pow(shift)
            .and_then(|m| base.checked_mul(m))
            .map(Self)
            .ok_or_else(bad)
    }

    /// Parse a JSON number or numeric string holding a decimal coin amount.
    pub fn from_json_decimal(v: &serde_json::Value, decimals: u32) -> Result<Self, LedgerError> {
        match v {
            serde_json::Value::Number(n) => Self::from_decimal_str(&n.to_string(), decimals),
            serde_json::Value::String(s) => Self::from_decimal_str(s, decimals),
            other => Err(LedgerError::Decode(format!("expected amount, got {other}"))),
        }
    }

    /// Parse a hex quantity (`"0x1bc16d674ec80000"`).
    pub fn from_hex(s: &str) -> Result<Self, LedgerError> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() {
            return Ok(Self::ZERO);
        }
        u128::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| LedgerError::Decode(format!("invalid hex amount '{s}'")))
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn saturating_mul(self, factor: u128) -> Amount {
        Amount(self.0.saturating_mul(factor))
    }

    /// Render as a decimal coin amount with `decimals` places, trailing zeros trimmed.
    pub fn to_decimal_string(&self, decimals: u32) -> String {
        if decimals == 0 {
            return self.0.to_string();
        }
        let raw = format!("{:0>width$}", self.0, width = decimals as usize + 1);
        let (int_part, frac_part) = raw.split_at(raw.len() - decimals as usize);
        let frac = frac_part.trim_end_matches('0');
        if frac.is_empty() {
            int_part.to_string()
        } else {
            format!("{int_part}.{frac}")
        }
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u128>()
            .map(Amount)
            .map_err(|_| LedgerError::Decode(format!("invalid amount '{s}'")))
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc.saturating_add(a))
    }
}

// u128 does not survive a JSON round trip through f64, so amounts travel as strings.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
