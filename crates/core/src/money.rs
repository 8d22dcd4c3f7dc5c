//! Integer money in micro-units of the ledger currency.
//!
//! One unit is 10⁻⁶ of a display unit; all arithmetic inside the platform is
//! integer arithmetic on this type. The wire/display form is a fixed
//! 4-decimal string (`"1.5000"`); inputs with more than 4 fractional digits
//! are rejected at the boundary and never reach the core. Never use floats
//! for money.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Micro-units per display unit.
pub const MICROS_PER_UNIT: i64 = 1_000_000;

/// Largest amount accepted at the boundary (10,000.0000 display units).
pub const MAX_AMOUNT: Money = Money(10_000 * MICROS_PER_UNIT);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("malformed amount: {0}")]
    Malformed(String),

    #[error("amount cannot be negative: {0}")]
    Negative(String),

    #[error("amount exceeds at most 4 fractional digits: {0}")]
    TooPrecise(String),

    #[error("amount {0} exceeds maximum {1}")]
    TooLarge(String, String),
}

/// An amount of money in integer micro-units.
///
/// Serializes transparently as the underlying integer; use [`Money::to_string`]
/// / [`Money::parse`] for the fixed 4-decimal wire form.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Parse a boundary amount string (`"1.5"`, `"1.5000"`, `"0.01"`).
    ///
    /// Rejects negatives, more than 4 fractional digits, and amounts above
    /// [`MAX_AMOUNT`].
    pub fn parse(s: &str) -> Result<Self, MoneyError> {
        let s = s.trim();
        if s.is_empty() || s.starts_with('+') {
            return Err(MoneyError::Malformed(s.to_string()));
        }
        if s.starts_with('-') {
            return Err(MoneyError::Negative(s.to_string()));
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MoneyError::Malformed(s.to_string()));
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MoneyError::Malformed(s.to_string()));
        }
        if frac.len() > 4 {
            return Err(MoneyError::TooPrecise(s.to_string()));
        }

        let whole: i64 = whole
            .parse()
            .map_err(|_| MoneyError::Malformed(s.to_string()))?;
        // Pad to 4 digits: "5" -> 5000 tenths-of-a-cent.
        let frac_4dp: i64 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<4}");
            padded
                .parse()
                .map_err(|_| MoneyError::Malformed(s.to_string()))?
        };

        let micros = whole
            .checked_mul(MICROS_PER_UNIT)
            .and_then(|w| w.checked_add(frac_4dp * 100))
            .ok_or_else(|| MoneyError::Malformed(s.to_string()))?;

        let amount = Money(micros);
        if amount > MAX_AMOUNT {
            return Err(MoneyError::TooLarge(
                amount.to_string(),
                MAX_AMOUNT.to_string(),
            ));
        }
        Ok(amount)
    }

    /// Validate an already-integer amount against the boundary range.
    pub fn validate_boundary(self) -> Result<Self, MoneyError> {
        if self.is_negative() {
            return Err(MoneyError::Negative(self.to_string()));
        }
        if self > MAX_AMOUNT {
            return Err(MoneyError::TooLarge(
                self.to_string(),
                MAX_AMOUNT.to_string(),
            ));
        }
        Ok(self)
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }

    pub fn max(self, other: Money) -> Money {
        Money(self.0.max(other.0))
    }

    /// Clamp into `[lo, hi]`.
    pub fn clamp(self, lo: Money, hi: Money) -> Money {
        Money(self.0.clamp(lo.0, hi.0))
    }

    /// Integer percentage of this amount (used for fee derivation).
    pub fn percent(self, pct: i64) -> Money {
        Money(self.0 * pct / 100)
    }
}

impl core::fmt::Display for Money {
    /// Fixed 4-decimal display form, rounding half-up from micro precision.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        // micro (6dp) -> tenths-of-a-cent (4dp), half-up.
        let rounded_4dp = (abs + 50) / 100;
        let whole = rounded_4dp / 10_000;
        let frac = rounded_4dp % 10_000;
        write!(f, "{sign}{whole}.{frac:04}")
    }
}

impl core::str::FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}
