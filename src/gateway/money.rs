use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Micro-units per whole currency unit.
pub const MICROS_PER_UNIT: i64 = 1_000_000;

/// Smallest unit a computed charge is rounded to (1/1000 of a unit).
pub const MICROS_PER_MILLI: i64 = 1_000;

/// Signed fixed-point currency amount stored as integer micro-units.
///
/// JSON carries it as a plain decimal number (`0.5`), which is what the
/// dashboard and API clients expect; arithmetic never touches floats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(MICROS_PER_MILLI))
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Converts a decimal amount, rounding half away from zero to whole micros.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let micros = (value * MICROS_PER_UNIT as f64).round();
        if micros > i64::MAX as f64 || micros < i64::MIN as f64 {
            return None;
        }
        Some(Self(micros as i64))
    }

    pub fn as_decimal(self) -> f64 {
        self.0 as f64 / MICROS_PER_UNIT as f64
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn checked_add(self, other: Money) -> Option<Money> {
        match self.0.checked_add(other.0) {
            Some(value) => Some(Money(value)),
            None => None,
        }
    }

    pub const fn checked_sub(self, other: Money) -> Option<Money> {
        match self.0.checked_sub(other.0) {
            Some(value) => Some(Money(value)),
            None => None,
        }
    }

    pub const fn negate(self) -> Money {
        Money(self.0.saturating_neg())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / MICROS_PER_UNIT as u64;
        let frac = abs % MICROS_PER_UNIT as u64;
        if frac % MICROS_PER_MILLI as u64 == 0 {
            write!(f, "{sign}{whole}.{:03}", frac / MICROS_PER_MILLI as u64)
        } else {
            write!(f, "{sign}{whole}.{frac:06}")
        }
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_decimal())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Money::from_decimal(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid money amount: {value}")))
    }
}
