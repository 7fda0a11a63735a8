use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer micro-units of the ledger currency (1 unit = 10^-6 of a display unit).
///
/// All internal arithmetic is integer; the only fractional representation
/// permitted anywhere near this type is the fixed-4-decimal wire string
/// produced by [`Money::to_fixed4`] / parsed by [`Money::parse_fixed4`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("money value is not a valid decimal string: {0}")]
    InvalidFormat(String),
    #[error("money value has more than 4 fractional digits: {0}")]
    TooManyFractionalDigits(String),
    #[error("money value overflows i64 micro-units: {0}")]
    Overflow(String),
}

impl Money {
    pub const ZERO: Money = Money(0);

    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    #[must_use]
    pub fn micros(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    #[must_use]
    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    #[must_use]
    pub fn min(self, other: Money) -> Money {
        if self.0 <= other.0 { self } else { other }
    }

    #[must_use]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Parses a fixed 4-decimal wire string (`"1.5000"`) into micro-units.
    /// Rejects values with more than 4 fractional digits — the boundary
    /// check spec.md §6 requires before a value ever reaches the core.
    pub fn parse_fixed4(input: &str) -> Result<Self, MoneyError> {
        let trimmed = input.trim();
        let (sign, unsigned) = match trimmed.strip_prefix('-') {
            Some(rest) => (-1i64, rest),
            None => (1i64, trimmed),
        };
        let mut parts = unsigned.splitn(2, '.');
        let whole = parts.next().unwrap_or("");
        let frac = parts.next().unwrap_or("");

        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(MoneyError::InvalidFormat(input.to_string()));
        }
        if !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(MoneyError::InvalidFormat(input.to_string()));
        }
        if frac.len() > 4 {
            return Err(MoneyError::TooManyFractionalDigits(input.to_string()));
        }

        let whole_value: i64 = whole
            .parse()
            .map_err(|_| MoneyError::Overflow(input.to_string()))?;
        let mut frac_padded = frac.to_string();
        while frac_padded.len() < 4 {
            frac_padded.push('0');
        }
        let frac_value: i64 = frac_padded
            .parse()
            .map_err(|_| MoneyError::Overflow(input.to_string()))?;

        let micros = whole_value
            .checked_mul(10_000)
            .and_then(|v| v.checked_add(frac_value))
            .and_then(|v| v.checked_mul(sign))
            .ok_or_else(|| MoneyError::Overflow(input.to_string()))?;
        Ok(Money(micros))
    }

    #[must_use]
    pub fn to_fixed4(self) -> String {
        let negative = self.0 < 0;
        let magnitude = self.0.unsigned_abs();
        let whole = magnitude / 10_000;
        let frac = magnitude % 10_000;
        format!("{}{whole}.{frac:04}", if negative { "-" } else { "" })
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_fixed4())
    }
}
