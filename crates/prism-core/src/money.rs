//! Fixed-point currency amounts and hourly cost rates.
//!
//! Ledger sums must be exact, so amounts are whole micro-units (one millionth of
//! the account currency) stored in an `i64`. Negative amounts are credits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

const MICROS_PER_UNIT: i64 = 1_000_000;
const MILLIS_PER_HOUR: i128 = 3_600_000;

/// A signed currency amount in micro-units.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Build an amount from micro-units.
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Build an amount from whole cents.
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents * 10_000)
    }

    /// Build an amount from a floating point value, rounded to the nearest micro-unit.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_dollars(value: f64) -> Self {
        Self((value * MICROS_PER_UNIT as f64).round() as i64)
    }

    /// Micro-units.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// The amount as a floating point value, for display and ratios only.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / MICROS_PER_UNIT as f64
    }

    /// Whether the amount is strictly positive.
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Whether the amount is strictly negative (a credit).
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Absolute value.
    #[must_use]
    pub const fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// `self / whole` as a fraction. Returns `0.0` when `whole` is zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio_of(self, whole: Self) -> f64 {
        if whole.0 == 0 {
            return 0.0;
        }
        self.0 as f64 / whole.0 as f64
    }

    /// Multiply by an integer factor, saturating on overflow.
    #[must_use]
    pub const fn times(self, factor: i64) -> Self {
        Self(self.0.saturating_mul(factor))
    }
}

impl fmt::Debug for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Money({}µ)", self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let units = abs / MICROS_PER_UNIT.unsigned_abs();
        let cents = (abs % MICROS_PER_UNIT.unsigned_abs()) / 10_000;
        write!(f, "{sign}${units}.{cents:02}")
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Self;

    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// A billing rate in micro-units per hour.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CostRate(i64);

impl CostRate {
    /// Rate from an hourly amount.
    #[must_use]
    pub const fn per_hour(amount: Money) -> Self {
        Self(amount.as_micros())
    }

    /// Rate from a daily amount (truncated to whole micro-units per hour).
    #[must_use]
    pub const fn per_day(amount: Money) -> Self {
        Self(amount.as_micros() / 24)
    }

    /// Hourly amount.
    #[must_use]
    pub const fn hourly(self) -> Money {
        Money::from_micros(self.0)
    }

    /// Daily amount.
    #[must_use]
    pub const fn daily(self) -> Money {
        Money::from_micros(self.0 * 24)
    }

    /// Cost of running at this rate for `duration`. Non-positive durations cost nothing.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn cost_for(self, duration: chrono::Duration) -> Money {
        let millis = i128::from(duration.num_milliseconds());
        if millis <= 0 {
            return Money::ZERO;
        }
        Money::from_micros((i128::from(self.0) * millis / MILLIS_PER_HOUR) as i64)
    }
}

impl fmt::Debug for CostRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CostRate({}µ/h)", self.0)
    }
}

impl fmt::Display for CostRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/h", self.hourly())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_rounds_to_cents() {
        assert_eq!(Money::from_dollars(24.8).to_string(), "$24.80");
        assert_eq!(Money::from_micros(-26_667).to_string(), "-$0.02");
        assert_eq!(Money::ZERO.to_string(), "$0.00");
    }

    #[test]
    fn daily_rate_converts_to_hourly() {
        let rate = CostRate::per_day(Money::from_dollars(2.40));
        assert_eq!(rate.hourly(), Money::from_dollars(0.10));
        assert_eq!(rate.daily(), Money::from_dollars(2.40));
    }

    #[test]
    fn cost_for_sixteen_minutes() {
        let rate = CostRate::per_day(Money::from_dollars(2.40));
        let cost = rate.cost_for(chrono::Duration::minutes(16));
        // 0.10/h * 16/60 h
        assert_eq!(cost, Money::from_micros(26_666));
    }

    #[test]
    fn cost_for_negative_duration_is_zero() {
        let rate = CostRate::per_hour(Money::from_dollars(1.0));
        assert_eq!(rate.cost_for(chrono::Duration::minutes(-5)), Money::ZERO);
    }

    #[test]
    fn sums_are_exact() {
        let parts = [
            Money::from_micros(100_000),
            Money::from_micros(-73_334),
            Money::from_micros(1),
        ];
        let total: Money = parts.iter().sum();
        assert_eq!(total, Money::from_micros(26_667));
    }

    #[test]
    fn ratio_handles_zero_whole() {
        assert!((Money::from_dollars(5.0).ratio_of(Money::ZERO)).abs() < f64::EPSILON);
        let half = Money::from_dollars(5.0).ratio_of(Money::from_dollars(10.0));
        assert!((half - 0.5).abs() < 1e-9);
    }
}
