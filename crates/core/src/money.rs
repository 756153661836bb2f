//! Monetary amounts and percentage rates.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Amount in the smallest currency unit (cents).
///
/// Arithmetic is checked; overflow surfaces as `DomainError::InvariantViolation`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Whole units + cents, e.g. `Money::from_major(1000, 0)` for 1000.00.
    pub const fn from_major(units: i64, cents: i64) -> Self {
        Self(units * 100 + cents)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::invariant("money addition overflow"))
    }

    pub fn checked_sub(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::invariant("money subtraction overflow"))
    }

    /// Sum an iterator of amounts with overflow checking.
    pub fn sum<I>(amounts: I) -> DomainResult<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.checked_add(m))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Percentage expressed in basis points (1% = 100 bps).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(u32);

impl Rate {
    pub const ZERO: Rate = Rate(0);

    pub const fn from_bps(bps: u32) -> Self {
        Self(bps)
    }

    pub const fn bps(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Rate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn displays_with_two_decimals() {
        assert_eq!(Money::from_major(1000, 0).to_string(), "1000.00");
        assert_eq!(Money::from_minor(-505).to_string(), "-5.05");
        assert_eq!(Rate::from_bps(250).to_string(), "2.50%");
    }

    #[test]
    fn overflow_is_an_invariant_violation() {
        let err = Money::from_minor(i64::MAX)
            .checked_add(Money::from_minor(1))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    proptest! {
        #[test]
        fn sum_matches_plain_addition(values in prop::collection::vec(-1_000_000i64..1_000_000i64, 0..50)) {
            let expected: i64 = values.iter().sum();
            let total = Money::sum(values.into_iter().map(Money::from_minor)).unwrap();
            prop_assert_eq!(total.minor(), expected);
        }
    }
}
