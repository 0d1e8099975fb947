use bigdecimal::BigDecimal;
use num_bigint::{BigInt, Sign};
use std::str::FromStr;

/// Number of wealth buckets in a distribution histogram.
pub const HISTOGRAM_BUCKETS: usize = 9;

/// Exact amount handling for ledger balances.
///
/// Raw amounts exceed both `u64` and `f64` precision, so everything here
/// works on `BigInt` / `BigDecimal` and never rounds.
pub struct AmountUtils;

impl AmountUtils {
    /// 10^30 raw units = 1 display unit
    pub const RAW_DECIMALS: i64 = 30;

    /// Balance + pending below this amount is ignored (0.001 display units).
    pub fn min_total() -> BigDecimal {
        BigDecimal::new(BigInt::from(1), 3)
    }

    /// Parse a raw amount as returned by the node. Negative amounts are rejected.
    pub fn parse_raw(raw: &str) -> Option<BigInt> {
        let value = BigInt::from_str(raw.trim()).ok()?;
        if value.sign() == Sign::Minus {
            return None;
        }
        Some(value)
    }

    /// Convert raw units to display units by shifting the decimal point.
    pub fn raw_to_display(raw: &BigInt) -> BigDecimal {
        BigDecimal::new(raw.clone(), Self::RAW_DECIMALS)
    }

    /// Parse a display amount. Accepts plain and exponent notation.
    pub fn parse_decimal(value: &str) -> Option<BigDecimal> {
        let parsed = BigDecimal::from_str(value.trim()).ok()?;
        if parsed < BigDecimal::default() {
            return None;
        }
        Some(parsed)
    }

    /// Number of digits in the integer part of `value`, ignoring sign.
    /// `0.5` has zero integer digits, `9.999` has one, `100000` has six.
    pub fn integer_digits(value: &BigDecimal) -> usize {
        let (_, integer, _) = Self::split(value);
        if integer == "0" {
            0
        } else {
            integer.len()
        }
    }

    /// Histogram bucket for a display total: `[0,1)` → 0, `[1,10)` → 1, …
    /// Totals beyond the last bucket are clamped into it.
    pub fn bucket_index(total: &BigDecimal) -> usize {
        Self::integer_digits(total).min(HISTOGRAM_BUCKETS - 1)
    }

    /// Plain decimal rendering without exponent or trailing zeros.
    pub fn format_decimal(value: &BigDecimal) -> String {
        let (negative, integer, fraction) = Self::split(value);
        let fraction = fraction.trim_end_matches('0');
        let sign = if negative && (integer != "0" || !fraction.is_empty()) {
            "-"
        } else {
            ""
        };

        if fraction.is_empty() {
            format!("{}{}", sign, integer)
        } else {
            format!("{}{}.{}", sign, integer, fraction)
        }
    }

    /// Split into (negative, integer digits, fraction digits). The integer part
    /// has no leading zeros and is "0" when empty.
    fn split(value: &BigDecimal) -> (bool, String, String) {
        let (digits, scale) = value.as_bigint_and_exponent();
        let negative = digits.sign() == Sign::Minus;
        let mut magnitude = digits.magnitude().to_string();

        if scale <= 0 {
            if magnitude != "0" {
                magnitude.push_str(&"0".repeat(scale.unsigned_abs() as usize));
            }
            return (negative, magnitude, String::new());
        }

        let scale = scale as usize;
        if magnitude.len() <= scale {
            magnitude = format!("{}{}", "0".repeat(scale - magnitude.len() + 1), magnitude);
        }

        let (integer, fraction) = magnitude.split_at(magnitude.len() - scale);
        let integer = integer.trim_start_matches('0');
        let integer = if integer.is_empty() { "0" } else { integer };
        (negative, integer.to_string(), fraction.to_string())
    }
}

/// Serde adapter writing decimals as exact strings and reading either strings
/// or JSON numbers.
pub mod decimal_string {
    use super::AmountUtils;
    use bigdecimal::BigDecimal;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &BigDecimal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&AmountUtils::format_decimal(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigDecimal, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_json(&value).ok_or_else(|| de::Error::custom(format!("invalid decimal amount: {}", value)))
    }

    pub fn from_json(value: &Value) -> Option<BigDecimal> {
        match value {
            Value::String(s) => AmountUtils::parse_decimal(s),
            Value::Number(n) => AmountUtils::parse_decimal(&n.to_string()),
            _ => None,
        }
    }
}
